// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use http::Uri;
use pct_str::{PctString, UriReserved};

use crate::error::UsageError;
use crate::{Error, ErrorKind, Result};

const DEVELOPMENT_STORAGE: &str = "http://127.0.0.1:10002/devstoreaccount1";

/// The base URL of a table service account.
///
/// Request URLs are derived from it: `{endpoint}/Tables` for table management,
/// `{endpoint}/{table}` for entities, and `{endpoint}/$batch` for transactions.
///
/// # Examples
///
/// ```
/// use tablestore::Endpoint;
///
/// let endpoint = Endpoint::parse("https://account.table.example.net/").unwrap();
/// assert_eq!(endpoint.as_str(), "https://account.table.example.net");
///
/// assert_eq!(Endpoint::development_storage().as_str(), "http://127.0.0.1:10002/devstoreaccount1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct Endpoint {
    base: String,
}

impl Endpoint {
    /// Parses an absolute `http` or `https` URL without query or fragment.
    ///
    /// A trailing slash is ignored.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the URL is not a valid endpoint.
    pub fn parse(url: impl AsRef<str>) -> Result<Self> {
        let url = url.as_ref();
        let invalid = || Error::usage(UsageError::InvalidEndpoint { url: url.to_owned() });

        let uri: Uri = url
            .parse()
            .map_err(|error| Error::caused_by(ErrorKind::Usage(UsageError::InvalidEndpoint { url: url.to_owned() }), error))?;
        let scheme_ok = matches!(uri.scheme_str(), Some("http" | "https"));

        if !scheme_ok || uri.authority().is_none() || uri.query().is_some() || url.contains('#') {
            return Err(invalid());
        }

        Ok(Self {
            base: url.trim_end_matches('/').to_owned(),
        })
    }

    /// Returns the endpoint of the local storage emulator.
    #[must_use]
    pub fn development_storage() -> Self {
        Self {
            base: DEVELOPMENT_STORAGE.to_owned(),
        }
    }

    /// Returns the endpoint URL without trailing slash.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.base
    }

    pub(crate) fn tables_uri(&self) -> Result<Uri> {
        to_uri(format!("{}/Tables", self.base))
    }

    pub(crate) fn table_uri(&self, table: &str) -> Result<Uri> {
        to_uri(format!("{}/Tables('{}')", self.base, encode(&quoted(table))))
    }

    /// The collection URL entities are inserted into.
    pub(crate) fn entities_url(&self, table: &str) -> String {
        format!("{}/{}", self.base, encode(table))
    }

    /// The URL addressing one entity.
    pub(crate) fn entity_url(&self, table: &str, partition_key: &str, row_key: &str) -> String {
        format!(
            "{}/{}(PartitionKey='{}',RowKey='{}')",
            self.base,
            encode(table),
            encode(&quoted(partition_key)),
            encode(&quoted(row_key))
        )
    }

    pub(crate) fn query_uri(&self, table: &str, parameters: &[(&'static str, String)]) -> Result<Uri> {
        let mut url = format!("{}/{}()", self.base, encode(table));

        for (index, (name, value)) in parameters.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&encode(value));
        }

        to_uri(url)
    }

    pub(crate) fn batch_uri(&self) -> Result<Uri> {
        to_uri(format!("{}/$batch", self.base))
    }
}

pub(crate) fn to_uri(url: String) -> Result<Uri> {
    Uri::try_from(url).map_err(Error::protocol)
}

fn quoted(value: &str) -> String {
    value.replace('\'', "''")
}

pub(crate) fn encode(value: &str) -> String {
    PctString::encode(value.chars(), UriReserved::Any).into_string()
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.base
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ftp://host/account")]
    #[case("/relative/path")]
    #[case("http://host/account?sv=1")]
    #[case("http://host/account#frag")]
    #[case("not a url")]
    fn rejects_invalid_endpoints(#[case] url: &str) {
        let error = Endpoint::parse(url).unwrap_err();

        assert!(matches!(error.usage_error(), Some(UsageError::InvalidEndpoint { .. })), "{url}");
    }

    #[test]
    fn builds_request_urls() {
        let endpoint = Endpoint::development_storage();

        assert_eq!(endpoint.tables_uri().unwrap(), "http://127.0.0.1:10002/devstoreaccount1/Tables");
        assert_eq!(endpoint.table_uri("t1").unwrap(), "http://127.0.0.1:10002/devstoreaccount1/Tables('t1')");
        assert_eq!(endpoint.batch_uri().unwrap(), "http://127.0.0.1:10002/devstoreaccount1/$batch");
        assert_eq!(
            endpoint.entity_url("t1", "it's", "a b"),
            "http://127.0.0.1:10002/devstoreaccount1/t1(PartitionKey='it%27%27s',RowKey='a%20b')"
        );
    }

    #[test]
    fn query_parameters_are_encoded() {
        let endpoint = Endpoint::parse("https://account.example.net").unwrap();
        let parameters = [("$filter", "a eq 'x'".to_owned()), ("$top", "4".to_owned())];

        let uri = endpoint.query_uri("t1", &parameters).unwrap();

        assert_eq!(uri, "https://account.example.net/t1()?$filter=a%20eq%20%27x%27&$top=4");
    }

    #[test]
    fn display_and_from_str_agree() {
        let endpoint: Endpoint = "http://localhost:10002/acct/".parse().unwrap();

        assert_eq!(endpoint.to_string(), "http://localhost:10002/acct");
        assert_eq!(String::from(endpoint), "http://localhost:10002/acct");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_uses_url_string() {
        let endpoint: Endpoint = serde_json::from_str("\"http://localhost:10002/acct\"").unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:10002/acct");
        assert_eq!(serde_json::to_string(&endpoint).unwrap(), "\"http://localhost:10002/acct\"");

        assert!(serde_json::from_str::<Endpoint>("\"ftp://x\"").is_err());
    }
}
