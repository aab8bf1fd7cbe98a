//! Defines routes for all object operations.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `GET    /objects` — list objects newest first (supports since, until, limit)
//!
//! - **Object-level endpoints**
//!   - `GET    /objects/{name}/meta` — indexed metadata record
//!   - `GET    /objects/{name}` — download object (optional from/to window)
//!   - `HEAD   /objects/{name}` — metadata headers only
//!   - `POST   /objects/{name}` — upload at offset `from` (PUT is an alias)
//!   - `DELETE /objects/{name}` — remove object
//!
//! - **Maintenance**
//!   - `POST   /admin/rescan` — rebuild the index from disk
//!
//! Object names are a single path segment; there is no hierarchy.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_object, head_object, list_objects, object_meta, rescan,
            upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all object routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/rescan", post(rescan))
        .route("/objects", get(list_objects))
        .route("/objects/{name}/meta", get(object_meta))
        .route(
            "/objects/{name}",
            get(get_object)
                .head(head_object)
                .post(upload_object)
                .put(upload_object)
                .delete(delete_object),
        )
}
