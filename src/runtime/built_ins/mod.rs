/// The core words of the language: stack manipulation, `dup`/`drop`.
pub mod base_words;

/// Words that drive the interpreter's own I/O: `print`, `cr`, `words`, `bye`.
pub mod core_words;

/// Words that bind the asynchronous event loop (timers, TCP) to the data stack.
pub mod uv_words;
