// ABOUTME: Library side of the buildwire CLI: collaborator adapters and command implementations.
// ABOUTME: The binary in main.rs only parses arguments and calls into here.

//! # buildwire-cli
//!
//! ```text
//! buildwire
//! ├── serve                         # Answer build requests with generator.command
//! ├── build <description>           # Request a build and follow its thread
//! ├── ask <question>                # Ask a question and print the answer
//! ├── validate <file>               # Check envelopes in a JSON file
//! └── config
//!     ├── init                      # Write a default config file
//!     ├── show                      # Print the effective config
//!     └── path                      # Print the config file location
//! ```

pub mod commands;
pub mod generator;
pub mod prompt;
pub mod store;

pub use generator::CommandCodeGenerator;
pub use prompt::TerminalPrompt;
pub use store::JsonlStore;

/// Version of the buildwire CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
