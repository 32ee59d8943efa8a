//! Site and environment resolution.
//!
//! Just enough of the site model for the workflow commands: name-to-id
//! lookup and an existence check for environments. Everything else about
//! sites lives behind other subcommands.

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;
use crate::request::Client;
use crate::request::RequestOptions;

/// A site on the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct Site {
    /// The site id.
    pub id: String,
    /// The site's machine name.
    #[serde(default)]
    pub name: String,
    /// The site's human-readable label.
    #[serde(default)]
    pub label: String,
}

/// An environment of a site.
#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    /// The environment id (its name).
    pub id: String,
}

/// The payload of a `site-names/{name}` lookup.
#[derive(Debug, Deserialize)]
struct SiteNameLookup {
    /// The resolved site id.
    id: String,
}

/// Resolves a site by name.
pub async fn find_site(client: &Client, name: &str) -> Result<Site> {
    let response = client
        .send(&format!("site-names/{name}"), RequestOptions::default())
        .await?;
    if response.status_code == StatusCode::NOT_FOUND {
        return Err(Error::SiteNotFound {
            site: name.to_string(),
        });
    }
    if response.is_error() {
        return Err(Error::Api {
            path: format!("site-names/{name}"),
            status: response.status_code.as_u16(),
            reason: response.reason,
        });
    }
    let lookup: SiteNameLookup = serde_json::from_value(response.data)?;

    let path = format!("sites/{id}", id = lookup.id);
    let response = client.send(&path, RequestOptions::default()).await?;
    if response.is_error() {
        return Err(Error::Api {
            path,
            status: response.status_code.as_u16(),
            reason: response.reason,
        });
    }
    Ok(serde_json::from_value(response.data)?)
}

/// Checks that an environment exists for a site.
pub async fn get_environment(client: &Client, site: &Site, env: &str) -> Result<Environment> {
    let path = format!("sites/{id}/environments/{env}", id = site.id);
    let response = client.send(&path, RequestOptions::default()).await?;
    if response.status_code == StatusCode::NOT_FOUND {
        return Err(Error::EnvironmentNotFound {
            site: site.name.clone(),
            env: env.to_string(),
        });
    }
    if response.is_error() {
        return Err(Error::Api {
            path,
            status: response.status_code.as_u16(),
            reason: response.reason,
        });
    }
    Ok(serde_json::from_value(response.data)?)
}
