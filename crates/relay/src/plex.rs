//! Plex media server client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Where to find a Plex server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// Plex library section type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Show,
    Season,
    Episode,
    Artist,
    Album,
    Track,
    Photo,
    #[serde(other)]
    Other,
}

impl MediaType {
    /// Value for the `type` query parameter when listing a section
    pub fn filter(&self) -> Option<&'static str> {
        match self {
            MediaType::Movie => Some("1"),
            MediaType::Show | MediaType::Season | MediaType::Episode => Some("4"),
            MediaType::Artist | MediaType::Album | MediaType::Track => Some("10"),
            MediaType::Photo => Some("14"),
            MediaType::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub title: String,
    /// Backing files as the server sees them
    pub files: Vec<String>,
}

impl Video {
    /// True if any backing file has the base name `filename`
    pub fn has_file_named(&self, filename: &str) -> bool {
        self.files
            .iter()
            .any(|f| Path::new(f).file_name().map_or(false, |n| n == filename))
    }
}

/// The operations the uploader needs from a media library.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn list(&self) -> Result<Vec<Video>>;

    /// Ask the server to rescan the library's storage
    async fn refresh(&self) -> Result<()>;

    async fn has_video(&self, filename: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|v| v.has_file_named(filename)))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    container: T,
}

#[derive(Deserialize)]
struct SectionList {
    #[serde(rename = "Directory", default)]
    directories: Vec<Section>,
}

#[derive(Debug, Clone, Deserialize)]
struct Section {
    key: String,
    title: String,
    #[serde(rename = "type")]
    kind: MediaType,
}

#[derive(Deserialize)]
struct MetadataList {
    #[serde(rename = "Metadata", default)]
    items: Vec<Metadata>,
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(default)]
    title: String,
    #[serde(rename = "Media", default)]
    media: Vec<Media>,
}

#[derive(Deserialize)]
struct Media {
    #[serde(rename = "Part", default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    file: String,
}

impl From<Metadata> for Video {
    fn from(m: Metadata) -> Self {
        Video {
            title: m.title,
            files: m
                .media
                .into_iter()
                .flat_map(|media| media.parts)
                .map(|part| part.file)
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlexClient {
    http: reqwest::Client,
    server: ServerConfig,
}

impl PlexClient {
    pub fn new(server: ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, server })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.server.url.trim_end_matches('/'), path);
        let resp = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .query(query)
            .query(&[("X-Plex-Token", self.server.token.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::platform(format!("GET {} returned {}", url, status)));
        }
        debug!("{} GET {}", status, url);
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let envelope: Envelope<T> = self.get(path, query).await?.json().await?;
        Ok(envelope.container)
    }

    /// Look up a library section by its title
    pub async fn find_library(&self, name: &str) -> Result<PlexLibrary> {
        let sections: SectionList = self
            .get_json("library/sections", &[])
            .await
            .map_err(|e| RelayError::platform(format!("unable to list Plex libraries: {}", e)))?;
        sections
            .directories
            .into_iter()
            .find(|s| s.title == name)
            .map(|section| PlexLibrary {
                client: self.clone(),
                id: section.key,
                name: section.title,
                kind: section.kind,
            })
            .ok_or_else(|| RelayError::NotFound(format!("library {}", name)))
    }
}

/// One library section on a Plex server
#[derive(Debug, Clone)]
pub struct PlexLibrary {
    client: PlexClient,
    pub id: String,
    pub name: String,
    pub kind: MediaType,
}

#[async_trait]
impl MediaLibrary for PlexLibrary {
    async fn list(&self) -> Result<Vec<Video>> {
        let path = format!("library/sections/{}/all", self.id);
        let query: Vec<(&str, &str)> = self.kind.filter().map(|f| ("type", f)).into_iter().collect();
        let list: MetadataList = self
            .client
            .get_json(&path, &query)
            .await
            .map_err(|e| RelayError::platform(format!("unable to list videos in the {} library: {}", self.name, e)))?;
        Ok(list.items.into_iter().map(Video::from).collect())
    }

    async fn refresh(&self) -> Result<()> {
        let path = format!("library/sections/{}/refresh", self.id);
        self.client
            .get(&path, &[])
            .await
            .map_err(|e| RelayError::platform(format!("unable to update the {} library: {}", self.name, e)))?;
        Ok(())
    }
}
