//! Routing-key extraction and startup rewriting
//!
//! Clients encode their destination into the PostgreSQL `user` parameter:
//!
//! ```text
//! alice.db-prod       → user=alice, deployment_id=db-prod, pooled=false
//! alice.db-prod.pool  → user=alice, deployment_id=db-prod, pooled=true
//! ```
//!
//! The extracted keys drive backend resolution and are stripped from the
//! startup message the backend sees.

use std::collections::HashMap;

use crate::discovery::{META_DEPLOYMENT_ID, META_POOLED, META_USERNAME};

use super::protocol::encode_startup;

/// The database name substituted when the client sent none, an empty one,
/// or reused the dotted `user` as the database (psql does this when no
/// database is given explicitly).
const DEFAULT_DATABASE: &str = "postgres";

/// Decompose the `user` parameter into routing keys, inserting
/// `deployment_id`, `pooled` and `username` into the map.
///
/// `user` itself is left untouched; the rewriter strips it later.
pub fn apply_routing(params: &mut HashMap<String, String>) {
    let Some(user) = params.get("user").cloned() else {
        return;
    };

    let segments: Vec<&str> = user.split('.').collect();
    if segments.len() < 2 {
        params.insert(META_POOLED.to_string(), "false".to_string());
        return;
    }

    if segments[segments.len() - 1] == "pool" && segments.len() >= 3 {
        params.insert(META_POOLED.to_string(), "true".to_string());
        params.insert(
            META_DEPLOYMENT_ID.to_string(),
            segments[segments.len() - 2].to_string(),
        );
        params.insert(
            META_USERNAME.to_string(),
            segments[..segments.len() - 2].join("."),
        );
    } else {
        params.insert(META_POOLED.to_string(), "false".to_string());
        params.insert(
            META_DEPLOYMENT_ID.to_string(),
            segments[segments.len() - 1].to_string(),
        );
        params.insert(
            META_USERNAME.to_string(),
            segments[..segments.len() - 1].join("."),
        );
    }
}

/// Default `database` when it is missing, empty, or equal to the original
/// (dotted) `user`.
pub fn apply_database_default(params: &mut HashMap<String, String>) {
    let original_user = params.get("user").cloned().unwrap_or_default();
    let needs_default = match params.get("database") {
        None => true,
        Some(db) => db.is_empty() || *db == original_user,
    };
    if needs_default {
        params.insert("database".to_string(), DEFAULT_DATABASE.to_string());
    }
}

/// Build the parameter set forwarded to the backend: every original
/// parameter except the routing keys and `user`, with `user` re-added as
/// the stripped username (or the original value when extraction yielded
/// nothing to strip).
pub fn forwarded_parameters(params: &HashMap<String, String>) -> HashMap<String, String> {
    let mut forwarded: HashMap<String, String> = params
        .iter()
        .filter(|(k, _)| {
            let k = k.as_str();
            k != META_DEPLOYMENT_ID && k != META_POOLED && k != META_USERNAME && k != "user"
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match params.get(META_USERNAME) {
        Some(username) if !username.is_empty() => {
            forwarded.insert("user".to_string(), username.clone());
        }
        _ => {
            if let Some(user) = params.get("user") {
                forwarded.insert("user".to_string(), user.clone());
            }
        }
    }

    forwarded
}

/// Run the full rewrite: extract routing keys into `params`, default the
/// database, and return the reconstructed startup packet to forward.
pub fn rewrite_startup(protocol_version: u32, params: &mut HashMap<String, String>) -> Vec<u8> {
    apply_routing(params);
    apply_database_default(params);
    encode_startup(protocol_version, &forwarded_parameters(params))
}
