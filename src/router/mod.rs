//! Router module - dot-path routing of named calls.
//!
//! Provides:
//! - [`RouteTrie`] - concurrent trie from `a.b.c` paths to handlers
//! - [`RouteNode`] - one segment of the trie
//!
//! # Example
//!
//! ```
//! use simplerpc::router::RouteTrie;
//!
//! let trie = RouteTrie::new();
//! trie.register("math.add", "adder").unwrap();
//!
//! assert_eq!(trie.resolve("math.add"), Some("adder"));
//! assert_eq!(trie.resolve("math"), None);
//! assert_eq!(trie.resolve("math.add.extra"), None);
//! ```

mod trie;

pub use trie::{split_path, RouteNode, RouteTrie};
