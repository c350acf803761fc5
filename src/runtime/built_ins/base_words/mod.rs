/// Words that manipulate the data stack.
mod stack_words;

use crate::runtime::{built_ins::base_words::stack_words::register_stack_words, interpreter::Interpreter};

/// Called to register all of the core words of the language.
pub fn register_base_words(interpreter: &mut dyn Interpreter) {
    register_stack_words(interpreter);
}
