use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<Arc<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Accounts
        .route("/users", post(handlers::create_user::<S>))
        // Projects
        .route(
            "/projects",
            get(handlers::list_projects::<S>).post(handlers::create_project::<S>),
        )
        .route(
            "/projects/:pid",
            get(handlers::get_project::<S>).delete(handlers::delete_project::<S>),
        )
        // Memberships
        .route(
            "/projects/:pid/members",
            get(handlers::list_members::<S>).post(handlers::add_member::<S>),
        )
        .route(
            "/projects/:pid/members/:uid",
            patch(handlers::update_member::<S>).delete(handlers::remove_member::<S>),
        )
        // Form schema
        .route("/projects/:pid/form", get(handlers::get_form::<S>))
        .route("/projects/:pid/form/fields", post(handlers::add_field::<S>))
        .route(
            "/projects/:pid/form/fields/:fid",
            patch(handlers::edit_field::<S>).delete(handlers::delete_field::<S>),
        )
        .route(
            "/projects/:pid/form/fields/:fid/move",
            post(handlers::move_field::<S>),
        )
        .route(
            "/projects/:pid/form/sections/move",
            post(handlers::move_section::<S>),
        )
        .route(
            "/projects/:pid/form/template",
            post(handlers::load_template::<S>),
        )
        // Outcome registry
        .route(
            "/projects/:pid/outcomes",
            get(handlers::list_outcomes::<S>).post(handlers::add_outcome::<S>),
        )
        .route(
            "/projects/:pid/outcomes/:oid",
            delete(handlers::delete_outcome::<S>),
        )
        // Change requests
        .route(
            "/projects/:pid/change-requests",
            get(handlers::list_change_requests::<S>),
        )
        .route(
            "/projects/:pid/change-requests/:rid/approve",
            post(handlers::approve_change_request::<S>),
        )
        .route(
            "/projects/:pid/change-requests/:rid/reject",
            post(handlers::reject_change_request::<S>),
        )
        // Studies and data entry
        .route(
            "/projects/:pid/studies",
            get(handlers::list_studies::<S>).post(handlers::create_study::<S>),
        )
        .route(
            "/projects/:pid/studies/:sid",
            get(handlers::get_study::<S>).delete(handlers::delete_study::<S>),
        )
        .route(
            "/projects/:pid/studies/:sid/data",
            get(handlers::get_study_data::<S>).post(handlers::submit_study_data::<S>),
        )
        .route(
            "/projects/:pid/studies/:sid/data/section",
            post(handlers::save_study_section::<S>),
        )
        // Export
        .route("/projects/:pid/export", get(handlers::export_project::<S>))
}
