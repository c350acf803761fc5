use crate::{
    add_native_word,
    runtime::{error, interpreter::Interpreter},
};
use std::io::Write;

/// Pop a string and write its raw bytes to standard output, flushing immediately. Bytes are
/// written verbatim, not decoded or validated as UTF-8, so a string carrying arbitrary binary data
/// (e.g. forwarded from a TCP read) reaches standard output unchanged.
///
/// Signature: `str -- `
fn word_print(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let bytes = interpreter.pop_as_string()?;

    std::io::stdout().write_all(&bytes)?;
    std::io::stdout().flush()?;

    Ok(())
}

/// Write a newline to standard output, flushing immediately.
///
/// Signature: ` -- `
fn word_cr(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let _ = interpreter;

    println!();
    std::io::stdout().flush()?;

    Ok(())
}

/// Print every word currently in the dictionary, newest first, space-separated, followed by a
/// newline.
///
/// Signature: ` -- `
fn word_words(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    println!("{}", interpreter.dictionary());
    std::io::stdout().flush()?;

    Ok(())
}

/// Clear the "running" flag the interactive prompt checks between lines. Has no effect on a
/// running event loop -- a timer or TCP callback armed before `bye` still fires if `uv:run` is
/// still driving the loop.
///
/// Signature: ` -- `
fn word_bye(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    interpreter.stop_running();

    Ok(())
}

/// Register `print`, `cr`, `words`, `bye`.
pub fn register_core_words(interpreter: &mut dyn Interpreter) {
    add_native_word!(
        interpreter,
        "print",
        word_print,
        "Write a string to standard output.",
        "str -- "
    );

    add_native_word!(interpreter, "cr", word_cr, "Write a newline to standard output.", " -- ");

    add_native_word!(
        interpreter,
        "words",
        word_words,
        "Print the names of every word in the dictionary, newest first.",
        " -- "
    );

    add_native_word!(
        interpreter,
        "bye",
        word_bye,
        "Stop the interactive prompt loop after this line.",
        " -- "
    );
}
