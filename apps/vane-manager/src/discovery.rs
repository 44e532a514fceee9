//! Controller discovery from Docker image labels.
//!
//! Images labelled `org.discon.type=controller` describe themselves through
//! `org.discon.controller.*` labels; discovery turns them into registry
//! descriptors and ingestion diffs them against the store. Deep validation
//! (symbol checks, test calls) lives outside the manager; only the basic
//! library-path sanity gate runs here.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bollard::image::ListImagesOptions;
use bollard::Docker;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::ValidationConfig;
use crate::registry::{ControllerDescriptor, PortPair};

const TYPE_LABEL: &str = "org.discon.type=controller";
const LABEL_PREFIX: &str = "org.discon.controller.";

#[derive(Debug, Clone)]
pub struct DiscoveredController {
    pub id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub description: String,
    pub library_path: String,
    pub proc_name: String,
    pub ports: PortPair,
    pub created_at: Option<OffsetDateTime>,
    pub is_valid: bool,
    pub validate_info: String,
}

/// Lists controller images and extracts their descriptor labels. Images
/// without a name or version label are skipped; a missing id is derived from
/// the repository tag.
pub async fn discover_controller_images(
    docker: &Docker,
    validation: &ValidationConfig,
) -> Result<Vec<DiscoveredController>> {
    let images = docker
        .list_images(Some(ListImagesOptions::<String> {
            filters: HashMap::from([("label".to_string(), vec![TYPE_LABEL.to_string()])]),
            ..Default::default()
        }))
        .await
        .context("error listing controller images")?;

    let mut controllers = Vec::new();
    for image in images {
        let Some(repo_tag) = image.repo_tags.first().cloned() else {
            debug!(id = %image.id, "skipping controller image with no tags");
            continue;
        };

        let label = |key: &str| {
            image
                .labels
                .get(&format!("{LABEL_PREFIX}{key}"))
                .cloned()
                .unwrap_or_default()
        };

        let mut id = label("id");
        if id.is_empty() {
            id = repo_tag.replace(['/', ':'], "-");
            debug!(image = %repo_tag, derived = %id, "image missing id label, deriving from tag");
        }

        let name = label("name");
        let version = label("version");
        if name.is_empty() || version.is_empty() {
            debug!(image = %repo_tag, "skipping image missing name or version labels");
            continue;
        }

        let ports = match label("ports").as_str() {
            "" => PortPair::default(),
            raw => serde_json::from_str(raw).unwrap_or_else(|err| {
                debug!(image = %repo_tag, %err, "error parsing ports label, using defaults");
                PortPair::default()
            }),
        };

        let library_path = label("library_path");
        let (is_valid, validate_info) = if validation.enabled && library_path.is_empty() {
            (false, "Library path not specified, validation failed".to_string())
        } else {
            (true, String::new())
        };

        let controller = DiscoveredController {
            id,
            name,
            version,
            image: repo_tag.clone(),
            description: label("description"),
            library_path,
            proc_name: label("proc_name"),
            ports,
            created_at: OffsetDateTime::parse(&label("created"), &Rfc3339).ok(),
            is_valid,
            validate_info,
        };
        info!(controller = %controller.name, image = %repo_tag, "discovered controller");
        controllers.push(controller);
    }

    Ok(controllers)
}

pub fn into_descriptor(discovered: DiscoveredController) -> ControllerDescriptor {
    let now = OffsetDateTime::now_utc();
    ControllerDescriptor {
        id: discovered.id,
        name: discovered.name,
        version: discovered.version,
        image: discovered.image,
        description: discovered.description,
        library_path: discovered.library_path,
        proc_name: discovered.proc_name,
        ports: discovered.ports,
        created_at: discovered.created_at.unwrap_or(now),
        updated_at: now,
        is_valid: discovered.is_valid,
        validate_info: discovered.validate_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_conversion_keeps_image_created_time() {
        let created = OffsetDateTime::parse("2024-03-01T12:00:00Z", &Rfc3339).unwrap();
        let discovered = DiscoveredController {
            id: "rosco".to_string(),
            name: "ROSCO".to_string(),
            version: "2.6".to_string(),
            image: "controllers/rosco:2.6".to_string(),
            description: String::new(),
            library_path: "/controllers/librosco.so".to_string(),
            proc_name: "DISCON".to_string(),
            ports: PortPair::default(),
            created_at: Some(created),
            is_valid: true,
            validate_info: String::new(),
        };
        let descriptor = into_descriptor(discovered);
        assert_eq!(descriptor.created_at, created);
        assert!(descriptor.updated_at >= created);
    }

    #[test]
    fn descriptor_conversion_defaults_missing_created_time() {
        let discovered = DiscoveredController {
            id: "x".to_string(),
            name: "x".to_string(),
            version: "1".to_string(),
            image: "x:1".to_string(),
            description: String::new(),
            library_path: String::new(),
            proc_name: String::new(),
            ports: PortPair::default(),
            created_at: None,
            is_valid: true,
            validate_info: String::new(),
        };
        let descriptor = into_descriptor(discovered);
        assert_eq!(descriptor.created_at, descriptor.updated_at);
    }
}
