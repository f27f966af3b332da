//! Runtime spawner and API-facing request/response models.

pub mod api;
pub mod tokio_spawner;

pub use api::{handle_request, health, list_page, HandleRequest, HandleResponse, Health, PageRequest, PageResponse};
pub use tokio_spawner::TokioSpawner;
