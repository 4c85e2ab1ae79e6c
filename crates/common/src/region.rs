//! Data-centre regions and their endpoint base URLs
//!
//! Each region has a separate accounts server (token endpoint) and API
//! server. Both are fixed per region; callers may override them for
//! proxies and tests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Token endpoint path on the accounts server.
pub const TOKEN_PATH: &str = "/oauth/v2/token";

/// Vendor data-centre region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    #[default]
    Us,
    Eu,
    In,
    Au,
    Cn,
    Jp,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Us,
        Region::Eu,
        Region::In,
        Region::Au,
        Region::Cn,
        Region::Jp,
    ];

    /// Accounts server base URL (token refresh).
    pub fn accounts_base_url(self) -> &'static str {
        match self {
            Region::Us => "https://accounts.zoho.com",
            Region::Eu => "https://accounts.zoho.eu",
            Region::In => "https://accounts.zoho.in",
            Region::Au => "https://accounts.zoho.com.au",
            Region::Cn => "https://accounts.zoho.com.cn",
            Region::Jp => "https://accounts.zoho.jp",
        }
    }

    /// API server base URL (resource and bulk endpoints).
    pub fn api_base_url(self) -> &'static str {
        match self {
            Region::Us => "https://www.zohoapis.com",
            Region::Eu => "https://www.zohoapis.eu",
            Region::In => "https://www.zohoapis.in",
            Region::Au => "https://www.zohoapis.com.au",
            Region::Cn => "https://www.zohoapis.com.cn",
            Region::Jp => "https://www.zohoapis.jp",
        }
    }

    /// Full token endpoint URL for this region.
    pub fn token_url(self) -> String {
        format!("{}{TOKEN_PATH}", self.accounts_base_url())
    }

    /// Short label used in logs and metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Us => "US",
            Region::Eu => "EU",
            Region::In => "IN",
            Region::Au => "AU",
            Region::Cn => "CN",
            Region::Jp => "JP",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Region::ALL
            .into_iter()
            .find(|region| region.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "region must be one of US, EU, IN, AU, CN, JP, got: {s}"
                ))
            })
    }
}
