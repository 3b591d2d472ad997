// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Client pipeline for a remote table storage service.
//!
//! A [`TableClient`] sends table and entity operations through an ordered chain of filters to a
//! pluggable transport. The crate provides the pieces of that pipeline:
//!
//! - [`FilterChain`] composes filters around the transport. Each filter sees the request on the
//!   way in and the response or error on the way out, and may send the request several times.
//! - [`retry::ExponentialRetryPolicy`] re-sends requests that failed transiently, waiting a
//!   jittered, exponentially growing interval between attempts.
//! - [`TableClient::begin_batch`] and [`TableClient::commit_batch`] accumulate entity mutations
//!   into an atomic batch that is encoded as a single multipart request; see [`batch`].
//!
//! The transport is any [`layered::Service`] that maps a [`Request`] to a [`Response`]. It
//! reports every HTTP status as a response and fails only when no response arrived. Signing
//! is delegated to a [`Sign`] collaborator that runs directly above the transport, once per
//! attempt.
//!
//! # Examples
//!
//! ```
//! use tablestore::testing::InMemoryTableService;
//! use tablestore::{Endpoint, Entity, TableClient, TableQuery};
//!
//! # futures::executor::block_on(async {
//! let client = TableClient::builder(Endpoint::development_storage(), InMemoryTableService::new()).build();
//!
//! client.create_table("people").await?;
//! client
//!     .insert_entity("people", Entity::new("smith", "john").with("Email", "john@example.com"))
//!     .await?;
//!
//! let john = client.query_entity("people", "smith", "john").await?;
//! assert_eq!(john.property("Email").and_then(|email| email.as_str()), Some("john@example.com"));
//!
//! let page = client
//!     .query_entities(&TableQuery::select().from("people").where_eq("PartitionKey", "smith"))
//!     .await?;
//! assert_eq!(page.entities().len(), 1);
//! # Ok::<(), tablestore::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Errors
//!
//! Every operation returns [`Error`], which distinguishes transport failures, service errors
//! carrying the status and code the service reported, misuse of the client, and malformed
//! responses. [`Error`] implements [`recoverable::Recovery`], classifying which failures are
//! worth retrying.
//!
//! # Features
//!
//! - `serde`: serialization of [`retry::RetryOptions`] and [`Endpoint`] for configuration files.
//! - `test-util`: the in-memory service and fault-injecting transport in [`testing`].

pub mod batch;
mod client;
mod endpoint;
mod entity;
pub mod error;
mod filter;
mod fn_wrapper;
mod query;
pub mod retry;
#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;
mod wire;

#[doc(inline)]
pub use client::{EntityDispatch, EntityResponse, QueryPage, TableClient, TableClientBuilder, TableInfo};
#[doc(inline)]
pub use endpoint::Endpoint;
#[doc(inline)]
pub use entity::{Entity, PropertyValue};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, ServiceError, UsageError};
#[doc(inline)]
pub use filter::{FilterChain, Pipeline, Sign, SignLayer, Signed};
#[doc(inline)]
pub use query::{ContinuationToken, TableQuery};
#[doc(inline)]
pub use wire::{Request, Response, ResponseInfo, Transport, merge_method};
