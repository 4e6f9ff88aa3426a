//! Redis instance lifecycle agent.
//!
//! [`LifecycleController`] is the embedding surface: an API layer constructs
//! one with a [`PersistenceAdapter`] and a [`SettingsProvider`], calls
//! [`LifecycleController::rehydrate`] once at startup, and drives instances
//! through create/start/stop/delete. Instances run either as native
//! `redis-server` processes or as Docker containers; the backend is fixed
//! when the instance is created.

pub mod backend;
pub mod config;
mod controller;
mod detector;
mod error;
mod events;
pub mod paths;
mod persist;
pub mod probe;
mod registry;
mod settings;

pub use controller::{DEFAULT_INSTANCE_ID, LifecycleController, RuntimeSupport};
pub use detector::poll_default_instance_once;
pub use error::LifecycleError;
pub use events::EventHub;
pub use persist::{JsonStore, PersistenceAdapter};
pub use registry::{InstanceEntry, InstanceRegistry, LogBuffer, LogSink};
pub use settings::{DefaultRedisSettings, SettingsProvider, StaticSettings};
