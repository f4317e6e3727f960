//! Site-visit domain: projects, GPS points, photos and parcel boundaries.

pub mod api_types;
pub mod client;
mod identity;
mod records;
pub mod types;

pub use client::{Fetched, FieldClient};
pub use identity::ServerAssignedIds;
pub use types::{BoundaryEntry, GpsPoint, Photo, PhotoRef, Project, ProjectStatus, Property};
