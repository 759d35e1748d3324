//! Integration testing module
//!
//! End-to-end tests for the streaming core:
//! - Negotiation through to raw or transcoded streams
//! - Cache hits and single-flight generation with real encoder processes
//! - Failure handling and request logging
