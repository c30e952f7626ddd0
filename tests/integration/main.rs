//! Integration tests for polychat
//! These tests focus on components working together rather than individual units

mod auth_refresh_test;
mod event_pipeline_test;
mod eventsub_dedup_test;
mod reconnect_test;
mod token_store_test;
