//! Tests for the tidemark-ecl crate.

mod helpers;
