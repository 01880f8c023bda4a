//! Docker Registry HTTP API v2 paths served by the container link.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRoute<'a> {
    /// `<prefix>v2/`
    Ping { prefix: &'a str },
    /// `<prefix>v2/<repository>/manifests/<reference>`
    Manifest {
        prefix: &'a str,
        repository: &'a str,
        reference: &'a str,
    },
    /// `<prefix>v2/<repository>/blobs/<digest>`
    Blob {
        prefix: &'a str,
        repository: &'a str,
        digest: &'a str,
    },
}

/// Compiled once when the chains are built and shared by every link.
#[derive(Debug, Clone)]
pub struct RegistryPatterns {
    ping: Regex,
    manifest: Regex,
    blob: Regex,
}

impl RegistryPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            ping: Regex::new("(.*/)v2/$")?,
            manifest: Regex::new("(.*/)v2/(.*)/manifests/(.*)")?,
            blob: Regex::new("(.*/)v2/(.*)/blobs/(.*)")?,
        })
    }

    /// Patterns are unanchored at the start and tried in the order ping,
    /// manifest, blob. The first match wins.
    pub fn classify<'a>(&self, path: &'a str) -> Option<RegistryRoute<'a>> {
        if let Some(caps) = self.ping.captures(path) {
            return Some(RegistryRoute::Ping {
                prefix: caps.get(1)?.as_str(),
            });
        }
        if let Some(caps) = self.manifest.captures(path) {
            return Some(RegistryRoute::Manifest {
                prefix: caps.get(1)?.as_str(),
                repository: caps.get(2)?.as_str(),
                reference: caps.get(3)?.as_str(),
            });
        }
        if let Some(caps) = self.blob.captures(path) {
            return Some(RegistryRoute::Blob {
                prefix: caps.get(1)?.as_str(),
                repository: caps.get(2)?.as_str(),
                digest: caps.get(3)?.as_str(),
            });
        }
        None
    }
}
