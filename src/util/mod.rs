//! Cross-cutting helpers shared across layers.

pub mod retry;
