/// Module for managing the original source code and tracking positions within it.
pub mod source_buffer;

/// Module for turning source code into a flat list of tokens for the interpreter to consume.
pub mod tokenizing;
