//! Qdrant vector store access over its REST API.

pub mod client;

pub use client::{QdrantClient, RetrievedPoint};
