//! Host item-lookup collaborator: item id → name, local extras, remote trailers.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, time::Duration};
use tracing::{debug, warn};

use crate::config::{expand, LibrarySettings};
use crate::descriptor::{LibraryItem, LocalTrailer, RemoteTrailer};

pub enum Library {
    Catalog(CatalogLibrary),
    Jellyfin(JellyfinLibrary),
}

impl Library {
    pub fn from_settings(settings: &LibrarySettings) -> Result<Self> {
        match settings {
            LibrarySettings::Catalog { path } => {
                let path = path.as_deref().map_or_else(default_catalog_path, expand);
                Ok(Self::Catalog(CatalogLibrary::load(Path::new(&path))?))
            }
            LibrarySettings::Jellyfin {
                url,
                api_key,
                timeout_ms,
            } => Ok(Self::Jellyfin(JellyfinLibrary::new(
                url,
                api_key,
                Duration::from_millis(*timeout_ms),
            )?)),
        }
    }

    /// `Ok(None)` when the id does not resolve to an item.
    pub async fn item(&self, id: &str) -> Result<Option<LibraryItem>> {
        match self {
            Self::Catalog(c) => Ok(c.item(id)),
            Self::Jellyfin(j) => j.item(id).await,
        }
    }
}

fn default_catalog_path() -> String {
    expand("$XDG_CONFIG_HOME/trailer-preview/library.json")
}

/// GUIDs arrive both dashed and compact; compare them in one form.
pub fn normalize_item_id(id: &str) -> String {
    id.trim()
        .chars()
        .filter(|c| *c != '-' && *c != '{' && *c != '}')
        .flat_map(char::to_lowercase)
        .collect()
}

// ------------------------- Catalog -------------------------

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    items: Vec<LibraryItem>,
}

/// Static item catalog read from a JSON file once at startup.
#[derive(Debug, Default)]
pub struct CatalogLibrary {
    items: HashMap<String, LibraryItem>,
}

impl CatalogLibrary {
    pub fn from_items(items: impl IntoIterator<Item = LibraryItem>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|it| (normalize_item_id(&it.id), it))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("library catalog {} not found, every lookup will miss", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing catalog {}", path.display()))?;
        debug!("loaded {} catalog items", file.items.len());
        Ok(Self::from_items(file.items))
    }

    pub fn item(&self, id: &str) -> Option<LibraryItem> {
        self.items.get(&normalize_item_id(id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ------------------------- Jellyfin -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsPage {
    #[serde(default)]
    items: Vec<HostItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    remote_trailers: Vec<HostRemoteTrailer>,
    #[serde(default)]
    local_trailer_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostRemoteTrailer {
    #[serde(default)]
    url: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostLocalTrailer {
    id: String,
    #[serde(default)]
    run_time_ticks: Option<i64>,
}

/// Queries a running Jellyfin server over its REST API.
pub struct JellyfinLibrary {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl JellyfinLibrary {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building library http client")?;
        Ok(Self {
            client,
            base: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn item(&self, id: &str) -> Result<Option<LibraryItem>> {
        let resp = self
            .client
            .get(format!("{}/Items", self.base))
            .query(&[
                ("ids", id),
                ("fields", "RemoteTrailers"),
                ("enableImages", "false"),
            ])
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .context("querying host items")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND
            || resp.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Ok(None);
        }
        let page: ItemsPage = resp
            .error_for_status()
            .context("host items status")?
            .json()
            .await
            .context("decoding host items")?;
        let Some(host) = page.items.into_iter().next() else {
            return Ok(None);
        };

        let local_trailers = if host.local_trailer_count > 0 {
            self.local_trailers(&host.id).await?
        } else {
            Vec::new()
        };

        Ok(Some(LibraryItem {
            id: host.id,
            name: host.name,
            local_trailers,
            remote_trailers: host
                .remote_trailers
                .into_iter()
                .filter(|t| !t.url.is_empty())
                .map(|t| RemoteTrailer {
                    url: t.url,
                    name: t.name,
                })
                .collect(),
        }))
    }

    async fn local_trailers(&self, id: &str) -> Result<Vec<LocalTrailer>> {
        let list: Vec<HostLocalTrailer> = self
            .client
            .get(format!("{}/Items/{id}/LocalTrailers", self.base))
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .context("querying local trailers")?
            .error_for_status()
            .context("local trailers status")?
            .json()
            .await
            .context("decoding local trailers")?;
        Ok(list
            .into_iter()
            .map(|t| LocalTrailer {
                id: t.id,
                runtime_ticks: t.run_time_ticks,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ids_compare_in_normal_form() {
        assert_eq!(
            normalize_item_id("A1B2C3D4-E5F6-7890-ABCD-EF1234567890"),
            "a1b2c3d4e5f67890abcdef1234567890"
        );
        assert_eq!(normalize_item_id("{abc}"), "abc");
    }

    #[test]
    fn catalog_loads_and_resolves() {
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("library.json");
        fs::write(
            &path,
            r#"{"items":[{"id":"A1B2-C3","name":"Alien","remoteTrailers":[{"url":"https://youtu.be/dQw4w9WgXcQ"}]}]}"#,
        )
        .expect("write catalog");
        let lib = CatalogLibrary::load(&path).expect("catalog loads");
        assert_eq!(lib.len(), 1);
        let item = lib.item("a1b2c3").expect("id resolves regardless of form");
        assert_eq!(item.name, "Alien");
        assert!(lib.item("missing").is_none());
    }

    #[test]
    fn missing_catalog_is_empty() {
        let dir = tempdir().expect("failed to create temp dir");
        let lib = CatalogLibrary::load(&dir.path().join("none.json")).expect("tolerated");
        assert!(lib.is_empty());
    }

    #[test]
    fn host_payload_decodes() {
        let page: ItemsPage = serde_json::from_str(
            r#"{"Items":[{"Id":"abc","Name":"Heat","LocalTrailerCount":0,"RemoteTrailers":[{"Url":"https://youtu.be/dQw4w9WgXcQ","Name":"Trailer"}]}],"TotalRecordCount":1}"#,
        )
        .expect("host json decodes");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].remote_trailers[0].name.as_deref(), Some("Trailer"));
    }
}
