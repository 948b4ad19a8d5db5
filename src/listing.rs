use crate::error::UpdaterError;
use crate::types::{FolderKey, RemoteFileEntry};
use log::{debug, warn};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

pub const LICENSE_EXTENSION: &str = ".dat";

const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ListingItem {
    name: Option<String>,
    download_url: Option<String>,
    #[serde(default)]
    size: u64,
}

pub struct ListingClient {
    client: reqwest::Client,
}

impl ListingClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Lists the license files of one dated folder.
    ///
    /// A missing folder is `Ok` with no entries; transport and parse
    /// failures are `Err` so callers can tell them apart from an empty period.
    pub async fn list_license_files(
        &self,
        base_url: &str,
        folder: &FolderKey,
    ) -> Result<Vec<RemoteFileEntry>, UpdaterError> {
        let url = format!("{}{}", base_url, folder);
        debug!("Fetching listing for {}: {}", folder, url);

        let resp = self
            .client
            .get(&url)
            .timeout(LISTING_TIMEOUT)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Remote folder {} does not exist", folder);
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(UpdaterError::HttpStatus {
                status: resp.status(),
                url,
            });
        }

        let body = resp.text().await?;
        let entries = parse_listing(&body)?;
        debug!("{} license file(s) in {}", entries.len(), folder);
        Ok(entries)
    }
}

pub fn parse_listing(body: &str) -> Result<Vec<RemoteFileEntry>, UpdaterError> {
    let items: Vec<ListingItem> = serde_json::from_str(body)?;
    debug!("Listing holds {} item(s)", items.len());

    Ok(items
        .into_iter()
        .filter_map(|item| match (item.name, item.download_url) {
            (Some(name), Some(_)) if is_license_file(&name) && !is_plain_file_name(&name) => {
                warn!("Skipping listing entry with unsafe name {:?}", name);
                None
            }
            (Some(name), Some(download_url)) if is_license_file(&name) => Some(RemoteFileEntry {
                name,
                download_url,
                size_bytes: item.size,
            }),
            _ => None,
        })
        .collect())
}

pub fn is_license_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(LICENSE_EXTENSION)
}

/// True when `name` is a single path component and cannot leave the folder it is joined to.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.contains(['/', '\\']) && Path::new(name).file_name() == Some(OsStr::new(name))
}
