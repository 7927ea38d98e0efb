use std::path::Path;

use figment::{
    providers::{Data, Format, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A provider whose data has been read and parsed up front.
///
/// Resolving eagerly means a missing or malformed file is reported when it is loaded, rather than when the
/// configuration is first queried.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    fn from_data<F: Format>(data: &str, metadata: Metadata) -> Result<Self, Error> {
        let data = Data::<F>::string(data).data()?;
        Ok(Self { data, metadata })
    }

    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file_data = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        Self::from_data::<Yaml>(&file_data, Metadata::from("YAML file", path.as_ref()))
    }

    pub fn from_yaml_str(data: &str) -> Result<Self, Error> {
        Self::from_data::<Yaml>(data, Metadata::named("YAML source string"))
    }

    pub fn from_json<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file_data = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        Self::from_data::<Json>(&file_data, Metadata::from("JSON file", path.as_ref()))
    }

    pub fn from_json_str(data: &str) -> Result<Self, Error> {
        Self::from_data::<Json>(data, Metadata::named("JSON source string"))
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
