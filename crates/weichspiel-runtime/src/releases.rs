use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LaunchError, Result},
    feed::ReleaseFeed,
    platform::{Arch, Platform},
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    /// API URL of the asset; fetch with `Accept: application/octet-stream`.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Release {
    #[serde(default)]
    pub tag_name: Option<String>,
    /// `None` for drafts, which rank like the epoch.
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// Picks the release with the latest `published_at`; the first one wins a tie.
///
/// An empty list yields an asset-less epoch release so that the caller reports
/// a missing asset instead of failing on the empty feed itself.
pub fn newest_release(releases: Vec<Release>) -> Release {
    releases
        .into_iter()
        .fold(Release::default(), |newest, next| {
            if next.published_at > newest.published_at {
                next
            } else {
                newest
            }
        })
}

fn asset_regex(platform: &Platform) -> Result<Regex> {
    let unsupported = || LaunchError::UnsupportedPlatform {
        what: format!("OS {platform}"),
    };
    let pattern = platform.asset_pattern().ok_or_else(unsupported)?;
    Regex::new(pattern).map_err(|_| unsupported())
}

/// First asset of `release` whose name matches the platform pattern.
pub fn asset_for_platform(release: &Release, platform: &Platform) -> Result<Asset> {
    let re = asset_regex(platform)?;
    release
        .assets
        .iter()
        .find(|a| re.is_match(&a.name))
        .cloned()
        .ok_or_else(|| LaunchError::NoMatchingAsset {
            platform: platform.to_string(),
        })
}

/// Finds the download for the newest runtime release on `platform`/`arch`.
///
/// Unsupported targets are rejected before the feed is contacted.
pub async fn resolve_asset(
    feed: &dyn ReleaseFeed,
    platform: &Platform,
    arch: &Arch,
) -> Result<Asset> {
    if !arch.is_supported() {
        return Err(LaunchError::UnsupportedPlatform {
            what: format!("architecture {arch}"),
        });
    }
    asset_regex(platform)?;

    let releases = feed.releases().await?;
    let newest = newest_release(releases);
    asset_for_platform(&newest, platform)
}
