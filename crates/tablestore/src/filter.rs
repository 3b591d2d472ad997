// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Composition of request filters in front of a transport.
//!
//! A filter is any [`Layer`] whose service maps a [`Request`] to a `Result<Response>`. Filters
//! added to a [`FilterChain`] run outer to inner in insertion order: with filters `[F1, F2]` a
//! request flows `F1 → F2 → transport` and the response flows back `F2 → F1 → caller`.
//!
//! Completion is structural. Each filter awaits the rest of the chain through
//! [`Service::execute`], so it observes exactly one outcome per call it makes and hands exactly
//! one outcome back.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use layered::{Execute, Service};
//! use tablestore::{FilterChain, Request, Response};
//! use tablestore::retry::ExponentialRetryPolicy;
//! use tick::Clock;
//!
//! # futures::executor::block_on(async {
//! let transport = Execute::new(|_request: Request| async move {
//!     Ok::<_, tablestore::Error>(Response::new(Bytes::new()))
//! });
//!
//! let pipeline = FilterChain::new()
//!     .filter(ExponentialRetryPolicy::new(&Clock::new_frozen()))
//!     .signer(|request: &mut Request| -> tablestore::Result<()> {
//!         request.headers_mut().insert("authorization", "SharedKey dev:c2ln".parse().unwrap());
//!         Ok(())
//!     })
//!     .into_pipeline(transport);
//!
//! let response = pipeline.execute(Request::new(Bytes::new())).await.unwrap();
//! assert!(response.status().is_success());
//! # });
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use layered::{DynamicService, DynamicServiceExt, Layer, Service};

use crate::Result;
use crate::fn_wrapper::define_fn_wrapper;
use crate::wire::{Request, Response, Transport};

/// A type-erased chain of filters ending in a transport.
pub type Pipeline = DynamicService<Request, Result<Response>>;

define_fn_wrapper!(WrapPipeline(Fn(inner: Pipeline) -> Pipeline));

/// An ordered list of filters.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<WrapPipeline>,
    signer: Option<SignLayer>,
}

impl FilterChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter. It runs inside every filter added before it.
    #[must_use]
    pub fn filter<L>(mut self, filter: L) -> Self
    where
        L: Layer<Pipeline> + Send + Sync + 'static,
        L::Service: Service<Request, Out = Result<Response>> + 'static,
    {
        self.filters.push(WrapPipeline::new(move |inner| wrap(&filter, inner)));
        self
    }

    /// Sets the signer invoked directly above the transport, once per attempt.
    #[must_use]
    pub fn signer(mut self, signer: impl Sign + 'static) -> Self {
        self.signer = Some(SignLayer::new(signer));
        self
    }

    /// Returns the number of filters in the chain, not counting the signer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if the chain holds no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Terminates the chain with a transport.
    #[must_use]
    pub fn into_pipeline<T>(self, transport: T) -> Pipeline
    where
        T: Transport + 'static,
    {
        let innermost = match self.signer {
            Some(signer) => signer.layer(transport).into_dynamic(),
            None => transport.into_dynamic(),
        };

        self.filters.iter().rev().fold(innermost, |inner, filter| filter.call(inner))
    }
}

/// Wraps a pipeline with one more outermost filter.
pub(crate) fn wrap<L>(filter: &L, inner: Pipeline) -> Pipeline
where
    L: Layer<Pipeline>,
    L::Service: Service<Request, Out = Result<Response>> + 'static,
{
    filter.layer(inner).into_dynamic()
}

/// Attaches credential material to a request.
///
/// The signer runs once per attempt, so requests re-sent by a retry filter are signed again.
/// Any `Fn(&mut Request) -> Result<()>` closure is a signer.
pub trait Sign: Send + Sync {
    /// Signs the request in place.
    ///
    /// # Errors
    ///
    /// An error aborts the attempt and is returned to the filters above.
    fn sign(&self, request: &mut Request) -> Result<()>;
}

impl<F> Sign for F
where
    F: Fn(&mut Request) -> Result<()> + Send + Sync,
{
    fn sign(&self, request: &mut Request) -> Result<()> {
        self(request)
    }
}

/// A layer that signs every request before passing it on.
#[derive(Clone)]
pub struct SignLayer {
    signer: Arc<dyn Sign>,
}

impl SignLayer {
    /// Creates a layer around the given signer.
    #[must_use]
    pub fn new(signer: impl Sign + 'static) -> Self {
        Self { signer: Arc::new(signer) }
    }
}

impl Debug for SignLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for SignLayer {
    type Service = Signed<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Signed {
            signer: Arc::clone(&self.signer),
            inner,
        }
    }
}

/// A service that signs requests before forwarding them, see [`SignLayer`].
#[derive(Clone)]
pub struct Signed<S> {
    signer: Arc<dyn Sign>,
    inner: S,
}

impl<S: Debug> Debug for Signed<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signed").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S> Service<Request> for Signed<S>
where
    S: Service<Request, Out = Result<Response>>,
{
    type Out = Result<Response>;

    async fn execute(&self, mut request: Request) -> Self::Out {
        self.signer.sign(&mut request)?;
        self.inner.execute(request).await
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use layered::Execute;
    use parking_lot::Mutex;

    use super::*;
    use crate::Error;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records its name on the way in and on the way out.
    struct Tag {
        name: &'static str,
        log: Log,
    }

    struct Tagged<S> {
        name: &'static str,
        log: Log,
        inner: S,
    }

    impl<S> Layer<S> for Tag {
        type Service = Tagged<S>;

        fn layer(&self, inner: S) -> Self::Service {
            Tagged {
                name: self.name,
                log: Arc::clone(&self.log),
                inner,
            }
        }
    }

    impl<S: Service<Request, Out = Result<Response>>> Service<Request> for Tagged<S> {
        type Out = Result<Response>;

        async fn execute(&self, request: Request) -> Self::Out {
            self.log.lock().push(format!("{}>", self.name));
            let out = self.inner.execute(request).await;
            self.log.lock().push(format!("<{}", self.name));
            out
        }
    }

    fn transport(log: Log) -> impl Transport + 'static {
        Execute::new(move |request: Request| {
            let auth = request.headers().get("authorization").map(|v| v.to_str().unwrap().to_owned());
            log.lock().push(format!("transport({})", auth.unwrap_or_default()));
            async move { Ok::<_, Error>(Response::new(Bytes::new())) }
        })
    }

    #[tokio::test]
    async fn filters_run_outer_to_inner_in_insertion_order() {
        let log = Log::default();

        let pipeline = FilterChain::new()
            .filter(Tag { name: "f1", log: Arc::clone(&log) })
            .filter(Tag { name: "f2", log: Arc::clone(&log) })
            .into_pipeline(transport(Arc::clone(&log)));

        pipeline.execute(Request::new(Bytes::new())).await.unwrap();

        assert_eq!(*log.lock(), vec!["f1>", "f2>", "transport()", "<f2", "<f1"]);
    }

    #[tokio::test]
    async fn empty_chain_goes_straight_to_transport() {
        let log = Log::default();
        let chain = FilterChain::new();
        assert!(chain.is_empty());

        let pipeline = chain.into_pipeline(transport(Arc::clone(&log)));
        pipeline.execute(Request::new(Bytes::new())).await.unwrap();

        assert_eq!(*log.lock(), vec!["transport()"]);
    }

    #[tokio::test]
    async fn signer_runs_innermost() {
        let log = Log::default();
        let sign_log = Arc::clone(&log);

        let chain = FilterChain::new()
            .filter(Tag { name: "f1", log: Arc::clone(&log) })
            .signer(move |request: &mut Request| -> Result<()> {
                sign_log.lock().push("sign".to_owned());
                request.headers_mut().insert("authorization", "token".parse().unwrap());
                Ok(())
            });
        assert_eq!(chain.len(), 1);

        let pipeline = chain.into_pipeline(transport(Arc::clone(&log)));
        pipeline.execute(Request::new(Bytes::new())).await.unwrap();

        assert_eq!(*log.lock(), vec!["f1>", "sign", "transport(token)", "<f1"]);
    }

    #[tokio::test]
    async fn signer_error_skips_transport() {
        let log = Log::default();

        let pipeline = FilterChain::new()
            .signer(|_request: &mut Request| -> Result<()> { Err(Error::protocol("no credentials")) })
            .into_pipeline(transport(Arc::clone(&log)));

        let error = pipeline.execute(Request::new(Bytes::new())).await.unwrap_err();

        assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn wrap_adds_outermost_filter() {
        let log = Log::default();
        let pipeline = FilterChain::new()
            .filter(Tag { name: "inner", log: Arc::clone(&log) })
            .into_pipeline(transport(Arc::clone(&log)));

        let pipeline = wrap(&Tag { name: "outer", log: Arc::clone(&log) }, pipeline);
        pipeline.execute(Request::new(Bytes::new())).await.unwrap();

        assert_eq!(*log.lock(), vec!["outer>", "inner>", "transport()", "<inner", "<outer"]);
    }

    #[test]
    fn static_assertions() {
        static_assertions::assert_impl_all!(FilterChain: Send, Sync, Clone, Debug);
        static_assertions::assert_impl_all!(SignLayer: Send, Sync, Clone, Debug);
        static_assertions::assert_impl_all!(Pipeline: Send, Sync, Clone);
    }
}
