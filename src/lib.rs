//! Storefront API Library
//!
//! Order pricing and lifecycle engine for a storefront backend: promo-code
//! validation and discount computation, shipping/tax calculation, atomic
//! stock reservation and release, unique order-number generation, and the
//! order/payment state machine with its side effects.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod services;

use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::ServiceError;

/// Shared application state composed at startup and handed to the HTTP
/// layer.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub cache: Arc<dyn cache::CacheBackend>,
    pub event_sender: events::EventSender,
    pub orders: Arc<services::orders::OrderService>,
}

impl AppState {
    /// Wires the engine together: connection pool, cache backend, event
    /// channel and services. The returned receiver feeds
    /// `events::process_events`, which the embedding application drives.
    pub async fn build(
        config: config::AppConfig,
    ) -> Result<(Self, mpsc::Receiver<events::Event>), ServiceError> {
        let db = Arc::new(
            db::establish_connection_with_config(&db::DbConfig::from(&config)).await?,
        );
        let cache = cache::CacheFactory::create(&config.cache).await;
        let (event_sender, event_receiver) = events::channel(256);
        let event_sender_arc = Arc::new(event_sender.clone());

        let orders = Arc::new(services::orders::OrderService::new(
            db.clone(),
            cache.clone(),
            Some(event_sender_arc),
            &config,
        )?);

        Ok((
            Self {
                db,
                config,
                cache,
                event_sender,
                orders,
            },
            event_receiver,
        ))
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
        }
    }
}
