//! Primitives for working with typed and untyped configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::BTreeSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
pub use figment::value;
use ignition_error::GenericError;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        ///
        /// Includes the equivalent environment variable names if environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's value was not of the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        ///
        /// This is a period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&BTreeSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum LookupSource {
    /// The configuration key is looked up in a form suitable for environment variables.
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is already uppercased, with a trailing underscore.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "__").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<value::Map<figment::Profile, value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// This loader provides a wrapper around a lower-level library, `figment`, to expose a simpler and focused API for both
/// loading configuration data from various sources, as well as querying it.
///
/// Sources have an implicit priority based on the order in which they are added: sources added later take precedence
/// over sources added earlier. Either a typed value can be extracted from the configuration
/// ([`into_typed`][Self::into_typed]), or the merged configuration can be queried by key
/// ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file or string
/// - JSON file or string
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: BTreeSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    fn push_provider<P>(mut self, provider: P) -> Self
    where
        P: Provider + Send + Sync + 'static,
    {
        self.providers.push(BoxedProvider(Box::new(provider)));
        self
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        Ok(self.push_provider(resolved_provider))
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid YAML.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved_provider) => self.push_provider(resolved_provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
                self
            }
        }
    }

    /// Loads configuration from the given YAML string.
    ///
    /// # Errors
    ///
    /// If the string is not valid YAML, an error will be returned.
    pub fn from_yaml_str(self, data: &str) -> Result<Self, ConfigurationError> {
        let resolved_provider = ResolvedProvider::from_yaml_str(data)
            .map_err(GenericError::from)
            .context(Generic)?;
        Ok(self.push_provider(resolved_provider))
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        Ok(self.push_provider(resolved_provider))
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid JSON.
    pub fn try_from_json<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_json(&path) {
            Ok(resolved_provider) => self.push_provider(resolved_provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read JSON configuration file. Ignoring.");
                self
            }
        }
    }

    /// Loads configuration from the given JSON string.
    ///
    /// # Errors
    ///
    /// If the string is not valid JSON, an error will be returned.
    pub fn from_json_str(self, data: &str) -> Result<Self, ConfigurationError> {
        let resolved_provider = ResolvedProvider::from_json_str(data)
            .map_err(GenericError::from)
            .context(Generic)?;
        Ok(self.push_provider(resolved_provider))
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `app`, any environment variable starting with `app_` would be matched. The prefix is case-insensitive.
    ///
    /// A double underscore in the remainder of the variable name separates nested keys, so `APP_PUBLIC_API__LISTEN_ADDRESS`
    /// sets `public_api.listen_address`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send + Sync`, so we snapshot its values instead of keeping it around.
        let env = Env::prefixed(&prefix).split("__");
        let values = env.data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.lookup_sources.insert(LookupSource::Environment { prefix });
            self = self.push_provider(Serialized::defaults(default_dict.clone()));
        }

        Ok(self)
    }

    fn into_figment(self) -> (Figment, BTreeSet<LookupSource>) {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        (figment, self.lookup_sources)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let (figment, lookup_sources) = self.into_figment();
        figment
            .extract()
            .map_err(|e| from_figment_error(&lookup_sources, e))
    }

    /// Consumes the configuration loader and wraps it in a generic wrapper.
    ///
    /// ## Errors
    ///
    /// Currently infallible. Reserved for sources that are validated when merged.
    pub fn into_generic(self) -> Result<GenericConfiguration, ConfigurationError> {
        let (figment, lookup_sources) = self.into_figment();
        Ok(GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources,
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: BTreeSet<LookupSource>,
}

/// A generic configuration object.
///
/// This represents the merged configuration derived from [`ConfigurationLoader`] in its raw form. Values can be
/// queried by key, and can be extracted either as typed values or in their raw form.
///
/// Keys must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested value. For example, given:
///
/// ```yaml
/// public_api:
///   listen_address: tcp://0.0.0.0:8080
/// ```
///
/// querying for `public_api.listen_address` returns `"tcp://0.0.0.0:8080"`, and querying for `public_api` returns the
/// nested object.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                // A nested key (`foo.bar`) may have been provided as a single flat environment variable (`FOO_BAR`), so
                // try again with nested key separators replaced to match.
                let fallback_key = key.replace('.', "_");
                self.inner
                    .figment
                    .extract_inner(&fallback_key)
                    .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
            }
            Err(e) => Err(from_figment_error(&self.inner.lookup_sources, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// The key must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested lookup.
    ///
    /// ## Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// variant will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if a key does not exist or could not be deserialized.
    ///
    /// The `Default` implementation of `T` will be used both if the key could not be found, as well as for any error
    /// during deserialization. This effectively swallows any errors and should generally be used sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// If the key exists in the configuration, and can be deserialized, `Ok(Some(value))` is returned. If the key does
    /// not exist, `Ok(None)` is returned.
    ///
    /// ## Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &BTreeSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            // Figment reports only the leaf name, so qualify it with the path it was missing from.
            let field: Cow<'static, str> = if e.path.is_empty() {
                field
            } else {
                Cow::Owned(format!("{}.{}", e.path.join("."), field))
            };

            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();

            // Always specify the original key as a valid key to try.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Section {
        listen_address: String,
        #[serde(default)]
        drain_window_secs: u64,
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_yaml_file() {
        let file = yaml_file("public_api:\n  listen_address: tcp://127.0.0.1:8080\n  drain_window_secs: 2\n");
        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_generic()
            .unwrap();

        let section: Section = config.get_typed("public_api").unwrap();
        assert_eq!(
            section,
            Section {
                listen_address: "tcp://127.0.0.1:8080".to_string(),
                drain_window_secs: 2,
            }
        );

        let addr: String = config.get_typed("public_api.listen_address").unwrap();
        assert_eq!(addr, "tcp://127.0.0.1:8080");
    }

    #[test]
    fn missing_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");

        assert!(ConfigurationLoader::default().from_yaml(&path).is_err());

        let config = ConfigurationLoader::default().try_from_yaml(&path).into_generic().unwrap();
        assert_eq!(config.try_get_typed::<String>("anything").unwrap(), None);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"{ "admin_api": { "listen_address": "tcp://127.0.0.1:8081" } }"#)
            .unwrap();

        let config = ConfigurationLoader::default()
            .from_json(file.path())
            .unwrap()
            .into_generic()
            .unwrap();

        let addr: String = config.get_typed("admin_api.listen_address").unwrap();
        assert_eq!(addr, "tcp://127.0.0.1:8081");

        // An unreadable file is skipped, leaving earlier sources intact.
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigurationLoader::default()
            .from_json(file.path())
            .unwrap()
            .try_from_json(dir.path().join("missing.json"))
            .into_generic()
            .unwrap();

        let addr: String = config.get_typed("admin_api.listen_address").unwrap();
        assert_eq!(addr, "tcp://127.0.0.1:8081");
    }

    #[test]
    fn malformed_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"{ not json").unwrap();

        assert!(ConfigurationLoader::default().from_json(file.path()).is_err());

        let config = ConfigurationLoader::default()
            .try_from_json(file.path())
            .into_generic()
            .unwrap();
        assert_eq!(config.try_get_typed::<String>("admin_api").unwrap(), None);
    }

    #[test]
    fn as_typed_deserializes_whole_configuration() {
        #[derive(Debug, Deserialize)]
        struct Root {
            admin_api: Section,
        }

        let config = ConfigurationLoader::default()
            .from_yaml_str("admin_api:\n  listen_address: tcp://127.0.0.1:8081\n  drain_window_secs: 1\n")
            .unwrap()
            .into_generic()
            .unwrap();

        let root: Root = config.as_typed().unwrap();
        assert_eq!(root.admin_api.listen_address, "tcp://127.0.0.1:8081");
        assert_eq!(root.admin_api.drain_window_secs, 1);

        // The same configuration, missing a required section, is reported as such.
        #[derive(Debug, Deserialize)]
        struct RootWithPublic {
            #[allow(dead_code)]
            public_api: Section,
        }

        assert!(matches!(
            config.as_typed::<RootWithPublic>(),
            Err(ConfigurationError::MissingField { .. })
        ));
    }

    #[test]
    fn later_sources_take_precedence() {
        let file = yaml_file("public_api:\n  listen_address: tcp://127.0.0.1:8080\n  drain_window_secs: 2\n");
        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .from_json_str(r#"{ "public_api": { "drain_window_secs": 7 } }"#)
            .unwrap()
            .into_generic()
            .unwrap();

        let section: Section = config.get_typed("public_api").unwrap();
        assert_eq!(section.listen_address, "tcp://127.0.0.1:8080");
        assert_eq!(section.drain_window_secs, 7);
    }

    #[test]
    fn environment_variables_override_files() {
        std::env::set_var("IGNCFGTEST_ADMIN_API__LISTEN_ADDRESS", "tcp://127.0.0.1:9999");
        std::env::set_var("IGNCFGTEST_LOG_LEVEL", "debug");

        let config = ConfigurationLoader::default()
            .from_yaml_str("admin_api:\n  listen_address: tcp://127.0.0.1:1111\n")
            .unwrap()
            .from_environment("igncfgtest")
            .unwrap()
            .into_generic()
            .unwrap();

        let section: Section = config.get_typed("admin_api").unwrap();
        assert_eq!(section.listen_address, "tcp://127.0.0.1:9999");

        // Flat variables remain reachable through the nested key form.
        let level: String = config.get_typed("log.level").unwrap();
        assert_eq!(level, "debug");
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn missing_field_help_text_names_environment_variable() {
        std::env::set_var("IGNCFGHELP_UNRELATED", "1");

        let config = ConfigurationLoader::default()
            .from_environment("igncfghelp")
            .unwrap()
            .into_generic()
            .unwrap();

        match config.get_typed::<String>("public_api.listen_address") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("IGNCFGHELP_"), "unexpected help text: {}", help_text);
            }
            other => panic!("expected missing field error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_type_is_reported() {
        let config = ConfigurationLoader::default()
            .from_json_str(r#"{ "public_api": { "listen_address": 42 } }"#)
            .unwrap()
            .into_generic()
            .unwrap();

        assert!(matches!(
            config.get_typed::<Section>("public_api"),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
        assert_eq!(config.get_typed_or_default::<Section>("public_api"), Section::default());
    }

    #[test]
    fn into_typed_deserializes_everything() {
        #[derive(Deserialize)]
        struct Root {
            public_api: Section,
        }

        let root: Root = ConfigurationLoader::default()
            .from_yaml_str("public_api:\n  listen_address: unix:///tmp/api.sock\n")
            .unwrap()
            .into_typed()
            .unwrap();
        assert_eq!(root.public_api.listen_address, "unix:///tmp/api.sock");
        assert_eq!(root.public_api.drain_window_secs, 0);
    }
}
