//! Authority (instance + tenant) validation and endpoint derivation.

// self
use crate::{_prelude::*, auth::TenantId};

/// Default public-cloud instance.
pub const DEFAULT_INSTANCE: &str = "https://login.microsoftonline.com/";

/// Errors raised while validating an authority.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum AuthorityError {
	/// Instances must use HTTPS (loopback hosts excepted).
	#[error("The instance must use HTTPS: {url}.")]
	InsecureInstance {
		/// Instance URL that failed validation.
		url: String,
	},
	/// The instance URL cannot carry query strings or fragments.
	#[error("The instance must not carry a query or fragment: {url}.")]
	UnexpectedComponents {
		/// Instance URL that failed validation.
		url: String,
	},
	/// The authority URL did not end with a tenant segment.
	#[error("The authority does not name a tenant: {url}.")]
	MissingTenant {
		/// Authority URL that failed validation.
		url: String,
	},
}

/// Validated authority that token requests are sent to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
	instance: Url,
	tenant: TenantId,
}
impl Authority {
	/// Builds an authority from an instance (for example `https://login.microsoftonline.com/`)
	/// and a tenant.
	pub fn new(instance: Url, tenant: TenantId) -> Result<Self, AuthorityError> {
		validate_instance(&instance)?;

		let mut instance = instance;

		if !instance.path().ends_with('/') {
			let path = format!("{}/", instance.path());

			instance.set_path(&path);
		}

		Ok(Self { instance, tenant })
	}

	/// Splits a full authority URL (`{instance}/{tenant}`) into its parts.
	pub fn parse(authority: &Url) -> Result<Self, AuthorityError> {
		let missing = || AuthorityError::MissingTenant { url: authority.to_string() };
		let mut segments =
			authority.path_segments().ok_or_else(missing)?.filter(|s| !s.is_empty()).collect::<Vec<_>>();
		let tenant = segments.pop().ok_or_else(missing)?;
		let tenant = TenantId::new(tenant).map_err(|_| missing())?;
		let mut instance = authority.clone();

		instance.set_path(&format!("/{}", segments.join("/")));

		Self::new(instance, tenant)
	}

	/// Instance URL (always ends with `/`).
	pub fn instance(&self) -> &Url {
		&self.instance
	}

	/// Tenant segment.
	pub fn tenant(&self) -> &TenantId {
		&self.tenant
	}

	/// Same instance, different tenant.
	pub fn with_tenant(&self, tenant: TenantId) -> Self {
		Self { instance: self.instance.clone(), tenant }
	}

	/// `{instance}{tenant}/oauth2/v2.0/token`.
	pub fn token_endpoint(&self) -> Result<Url, url::ParseError> {
		self.instance.join(&format!("{}/oauth2/v2.0/token", self.tenant))
	}
}
impl Display for Authority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "{}{}", self.instance, self.tenant)
	}
}

fn validate_instance(url: &Url) -> Result<(), AuthorityError> {
	let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));

	if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
		return Err(AuthorityError::InsecureInstance { url: url.to_string() });
	}
	if url.query().is_some() || url.fragment().is_some() {
		return Err(AuthorityError::UnexpectedComponents { url: url.to_string() });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn tenant(value: &str) -> TenantId {
		TenantId::new(value).expect("Tenant fixture should be valid.")
	}

	#[test]
	fn token_endpoint_is_derived_from_instance_and_tenant() {
		let authority = Authority::new(
			Url::parse("https://login.microsoftonline.com").expect("Instance should parse."),
			tenant("contoso.onmicrosoft.com"),
		)
		.expect("Public cloud authority should be valid.");

		assert_eq!(
			authority.token_endpoint().expect("Token endpoint should join.").as_str(),
			"https://login.microsoftonline.com/contoso.onmicrosoft.com/oauth2/v2.0/token"
		);
		assert_eq!(authority.to_string(), "https://login.microsoftonline.com/contoso.onmicrosoft.com");
	}

	#[test]
	fn parse_splits_tenant_from_instance() {
		let authority = Authority::parse(
			&Url::parse("https://login.example.com/prefix/tenant-a").expect("Authority should parse."),
		)
		.expect("Authority with a prefix should be valid.");

		assert_eq!(authority.tenant().as_ref(), "tenant-a");
		assert_eq!(authority.instance().as_str(), "https://login.example.com/prefix/");
		assert!(matches!(
			Authority::parse(&Url::parse("https://login.example.com/").expect("URL should parse.")),
			Err(AuthorityError::MissingTenant { .. })
		));
	}

	#[test]
	fn insecure_instances_are_rejected_except_loopback() {
		let insecure = Url::parse("http://login.example.com/").expect("URL should parse.");

		assert!(matches!(
			Authority::new(insecure, tenant("t")),
			Err(AuthorityError::InsecureInstance { .. })
		));

		let loopback = Url::parse("http://127.0.0.1:8080/").expect("URL should parse.");

		Authority::new(loopback, tenant("t")).expect("Loopback instances should be accepted.");
	}
}
