//! Small helpers shared by the informer adapter and the writer.

use kube::core::ApiResource;

use zen_common::GvrSpec;
use zen_engine::GvrTarget;

/// Guess a kind name from a resource plural. Only used to label dynamic
/// objects; the watch and create URLs are built from the plural itself.
pub fn kind_guess(resource: &str) -> String {
    let singular = if let Some(stem) = resource.strip_suffix("ies") {
        format!("{stem}y")
    } else if resource.ends_with("ses") || resource.ends_with("xes") || resource.ends_with("zes") {
        resource[..resource.len() - 2].to_string()
    } else if let Some(stem) = resource.strip_suffix('s') {
        stem.to_string()
    } else {
        resource.to_string()
    };

    let mut chars = singular.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => singular,
    }
}

pub fn api_resource_for(gvr: &GvrSpec) -> ApiResource {
    let api_version = if gvr.group.is_empty() {
        gvr.version.clone()
    } else {
        format!("{}/{}", gvr.group, gvr.version)
    };
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version,
        kind: kind_guess(&gvr.resource),
        plural: gvr.resource.clone(),
    }
}

pub fn api_resource_for_target(target: &GvrTarget) -> ApiResource {
    api_resource_for(&GvrSpec {
        group: target.group.clone(),
        version: target.version.clone(),
        resource: target.resource.clone(),
    })
}

/// Build a generate-name prefix from a source key: RFC 1123 label charset,
/// bounded so the server-side suffix still fits.
pub fn generate_name_prefix(source: &str) -> String {
    let cleaned: String = source
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    let bounded: String = trimmed.chars().take(40).collect();
    if bounded.is_empty() {
        "observation-".to_string()
    } else {
        format!("{bounded}-")
    }
}
