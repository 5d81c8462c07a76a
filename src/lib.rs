// Quire - Collaborative Entity Editing Core

pub mod actions;
pub mod client;
pub mod config;
pub mod document;
pub mod entity;
pub mod error;
pub mod observable;
pub mod ot;
pub mod request_queue;
pub mod reverter;
pub mod schema;
pub mod warnings;

pub use actions::EntityActions;
pub use client::{EntityClient, RateLimitedClient};
pub use config::SyncConfig;
pub use document::{
    DocState, Document, DocumentOptions, DocumentStatus, FieldLocaleView, LocalActivity, SubPath,
};
pub use entity::{Entity, EntityRef, EntityType, SysMetadata, UserRef, Versioned};
pub use error::{Result, SyncError};
pub use observable::Property;
pub use request_queue::RequestQueue;
pub use reverter::EntryReverter;
pub use schema::{ContentType, FieldSpec, Locale};
pub use warnings::{PublicationWarnings, Warning};
