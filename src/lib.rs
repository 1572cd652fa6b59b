//! Credential-and-token broker for OAuth 2.0 confidential clients: single-flight credential
//! loading, two-tier token caches, and federated identity credential chaining in one crate.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod credentials;
pub mod error;
pub mod factory;
pub mod flows;
pub mod http;
pub mod oauth;
pub mod obs;
pub mod options;
pub mod provider;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// crates.io
	use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse};
	// self
	use crate::{
		credentials::{CredentialDescriptor, CredentialResolver},
		flows::TokenAcquirer,
		http::{ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
		oauth::TransportErrorMapper,
		options::ApplicationOptions,
		store::{MemoryDistributedCache, TokenCacheStore, TokenCacheStoreOptions},
	};

	/// Transport error emitted by [`ScriptedHttpClient`] once its script runs dry.
	#[derive(Debug, ThisError)]
	#[error("Scripted transport has no response left for {0}.")]
	pub struct ScriptExhausted(pub String);

	/// Outbound request captured by [`ScriptedHttpClient`].
	#[derive(Clone, Debug)]
	pub struct RecordedRequest {
		/// Request URI.
		pub uri: String,
		/// HTTP method.
		pub method: String,
		/// Request headers (lower-cased names).
		pub headers: BTreeMap<String, String>,
		/// Decoded `application/x-www-form-urlencoded` body.
		pub form: BTreeMap<String, String>,
	}

	/// Canned response served by [`ScriptedHttpClient`].
	#[derive(Clone, Debug)]
	pub struct ScriptedResponse {
		/// HTTP status code.
		pub status: u16,
		/// Extra response headers.
		pub headers: Vec<(String, String)>,
		/// Response body.
		pub body: String,
	}
	impl ScriptedResponse {
		/// JSON response with the provided status.
		pub fn json(status: u16, body: impl Into<String>) -> Self {
			Self { status, headers: Vec::new(), body: body.into() }
		}

		/// Successful token response carrying `access_token` and `expires_in`.
		pub fn token(access_token: &str, expires_in: i64) -> Self {
			Self::json(
				200,
				format!(
					"{{\"token_type\":\"Bearer\",\"access_token\":\"{access_token}\",\"expires_in\":{expires_in}}}"
				),
			)
		}

		/// Adds a response header.
		pub fn with_header(mut self, name: &str, value: &str) -> Self {
			self.headers.push((name.into(), value.into()));

			self
		}
	}

	/// In-process [`TokenHttpClient`] that serves scripted responses and records every
	/// request, so protocol-level assertions can inspect exact form bodies.
	#[derive(Clone, Default)]
	pub struct ScriptedHttpClient {
		script: Arc<Mutex<VecDeque<ScriptedResponse>>>,
		fallback: Arc<Mutex<Option<ScriptedResponse>>>,
		requests: Arc<Mutex<Vec<RecordedRequest>>>,
	}
	impl ScriptedHttpClient {
		/// Queues a response served exactly once.
		pub fn push(&self, response: ScriptedResponse) -> &Self {
			self.script.lock().push_back(response);

			self
		}

		/// Response served whenever the queue is empty.
		pub fn always(&self, response: ScriptedResponse) -> &Self {
			*self.fallback.lock() = Some(response);

			self
		}

		/// Requests observed so far.
		pub fn requests(&self) -> Vec<RecordedRequest> {
			self.requests.lock().clone()
		}

		/// Number of requests observed so far.
		pub fn calls(&self) -> usize {
			self.requests.lock().len()
		}
	}
	impl TokenHttpClient for ScriptedHttpClient {
		type Handle = ScriptedHandle;
		type TransportError = ScriptExhausted;

		fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
			ScriptedHandle { client: self.clone(), slot }
		}
	}

	/// Handle returned by [`ScriptedHttpClient::with_metadata`].
	pub struct ScriptedHandle {
		client: ScriptedHttpClient,
		slot: ResponseMetadataSlot,
	}
	impl<'c> AsyncHttpClient<'c> for ScriptedHandle {
		type Error = HttpClientError<ScriptExhausted>;
		type Future =
			Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send + Sync>>;

		fn call(&'c self, request: HttpRequest) -> Self::Future {
			let client = self.client.clone();
			let slot = self.slot.clone();

			Box::pin(async move {
				slot.take();

				let uri = request.uri().to_string();
				let headers = request
					.headers()
					.iter()
					.map(|(name, value)| {
						(name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned())
					})
					.collect();
				let form = url::form_urlencoded::parse(request.body())
					.into_owned()
					.collect::<BTreeMap<_, _>>();

				client.requests.lock().push(RecordedRequest {
					uri: uri.clone(),
					method: request.method().to_string(),
					headers,
					form,
				});

				let next = client.script.lock().pop_front().or_else(|| client.fallback.lock().clone());
				let Some(scripted) = next else {
					return Err(HttpClientError::Other(ScriptExhausted(uri).to_string()));
				};

				slot.store(ResponseMetadata { status: Some(scripted.status), retry_after: None });

				let mut response = HttpResponse::new(scripted.body.into_bytes());

				*response.status_mut() = oauth2::http::StatusCode::from_u16(scripted.status)
					.map_err(|e| HttpClientError::Other(e.to_string()))?;

				for (name, value) in scripted.headers {
					let name = oauth2::http::HeaderName::from_bytes(name.as_bytes())
						.map_err(|e| HttpClientError::Other(e.to_string()))?;
					let value = oauth2::http::HeaderValue::from_str(&value)
						.map_err(|e| HttpClientError::Other(e.to_string()))?;

					response.headers_mut().insert(name, value);
				}

				Ok(response)
			})
		}
	}

	/// Maps [`ScriptExhausted`] failures into broker transport errors.
	#[derive(Clone, Debug, Default)]
	pub struct ScriptedTransportErrorMapper;
	impl TransportErrorMapper<ScriptExhausted> for ScriptedTransportErrorMapper {
		fn map_transport_error(
			&self,
			meta: Option<&ResponseMetadata>,
			error: HttpClientError<ScriptExhausted>,
		) -> Error {
			let _ = meta;

			crate::error::TransportError::network(std::io::Error::other(error.to_string())).into()
		}
	}

	/// Acquirer type alias used by scripted tests.
	pub type ScriptedAcquirer = TokenAcquirer<ScriptedHttpClient, ScriptedTransportErrorMapper>;

	/// Builds an acquirer backed by a scripted transport and an in-memory L2 cache.
	pub fn build_scripted_acquirer(
		options: ApplicationOptions,
	) -> (ScriptedAcquirer, ScriptedHttpClient, Arc<MemoryDistributedCache>) {
		let http = ScriptedHttpClient::default();
		let l2 = Arc::new(MemoryDistributedCache::default());
		let cache = TokenCacheStore::new(l2.clone(), TokenCacheStoreOptions::default())
			.expect("Default cache options should be valid.");
		let resolver = CredentialResolver::with_http_client(
			Arc::new(http.clone()),
			Arc::new(ScriptedTransportErrorMapper),
		);
		let acquirer = TokenAcquirer::with_http_client(
			options,
			Arc::new(cache),
			Arc::new(resolver),
			http.clone(),
			ScriptedTransportErrorMapper,
		);

		(acquirer, http, l2)
	}

	/// Path to the PEM bundle (self-signed certificate + PKCS#8 key) used by tests.
	pub fn test_certificate_path() -> std::path::PathBuf {
		std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/client-cert.pem")
	}

	/// Descriptor that loads [`test_certificate_path`] from disk.
	pub fn test_certificate_descriptor() -> CredentialDescriptor {
		CredentialDescriptor::from_path(test_certificate_path(), None)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		hash::{Hash, Hasher},
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use tokio_util::sync::CancellationToken;
	pub use url::Url;
	pub use uuid::Uuid;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
