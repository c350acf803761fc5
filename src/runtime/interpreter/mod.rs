pub mod vm;

use crate::{
    lang::{
        source_buffer::SourceLocation,
        tokenizing::{Token, TokenList},
    },
    runtime::{
        data_structures::{
            dictionary::{Dictionary, WordRuntime},
            quotation::QuotationId,
            value::Value,
        },
        error,
        handle::{HandleId, HandleRegistry},
    },
};
use std::{
    fmt::{self, Display, Formatter},
    rc::Rc,
};

/// One entry in the call stack: the name of the word being executed and where the call was made
/// from.  Kept around purely for error reporting -- see `ScriptError`'s call stack dump.
#[derive(Clone)]
pub struct CallItem {
    pub name: String,
    pub location: SourceLocation,
}

impl Display for CallItem {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}, called from {}", self.name, self.location)
    }
}

/// The interpreter's call stack, most recent call last.
pub type CallStack = Vec<CallItem>;

/// The signature every native word handler must implement.  Handlers mutate the interpreter
/// through the trait object -- pop their arguments, push their results, raise a `ScriptError` on
/// misuse -- and otherwise know nothing about how the interpreter is wired together.
pub type WordHandler = dyn Fn(&mut dyn Interpreter) -> error::Result<()>;

/// The value stack proper.
pub type ValueStack = Vec<Value>;

/// Push and pop values on the data stack, with typed helpers for the four `Value` variants that
/// pop and downcast in one step, raising a `ScriptError` against the interpreter's current
/// location on an empty stack or a type mismatch.
pub trait InterpreterStack {
    fn stack(&self) -> &ValueStack;

    fn push(&mut self, value: Value);

    fn pop(&mut self) -> error::Result<Value>;

    fn pop_as_int(&mut self) -> error::Result<i64>;

    /// Pop the top value, requiring it to be a `String`, and return its raw bytes undecoded --
    /// not necessarily valid UTF-8. Callers that need text (an IP address, a word name) must
    /// decode explicitly and handle the failure case rather than assuming validity.
    fn pop_as_string(&mut self) -> error::Result<Vec<u8>>;

    fn pop_as_quote(&mut self) -> error::Result<QuotationId>;

    fn pop_as_handle(&mut self) -> error::Result<HandleId>;
}

/// Register native words, look words up, and drive the call stack used for error reporting.
pub trait WordManagement {
    /// Register a new word in the dictionary.
    #[allow(clippy::too_many_arguments)]
    fn add_word(
        &mut self,
        location: SourceLocation,
        name: &str,
        handler: Rc<WordHandler>,
        description: &str,
        signature: &str,
        runtime: WordRuntime,
    );

    /// The dictionary, for `words` and diagnostics.
    fn dictionary(&self) -> &Dictionary;

    /// Look up and execute a word by name.  Handles number literals (text that parses via
    /// `lang::tokenizing::parse_number` is pushed as an `Int` rather than looked up), native
    /// words, and colon-defined words -- the latter by re-interpreting the quotation's stored
    /// tokens.
    fn execute_word_named(&mut self, location: &SourceLocation, name: &str) -> error::Result<()>;

    fn call_stack(&self) -> &CallStack;
}

/// Interpret a previously-tokenized source or quotation body, and intern bracketed quotations
/// encountered along the way.
pub trait Execution {
    /// Run the compile/immediate state machine over a flat token list: recognizes `:`, `;`, `[`,
    /// `]` and dispatches everything else to `execute_word_named`, `Str` literals as string
    /// pushes, and `QuoteRef` tokens as quote-value pushes.
    fn interpret_tokens(&mut self, tokens: &TokenList) -> error::Result<()>;

    /// Run a previously interned quotation's tokens directly, without re-scanning for `:`/`;` --
    /// used to invoke an event-loop callback.
    fn execute_quotation(&mut self, id: QuotationId) -> error::Result<()>;

    fn current_location(&self) -> &Option<SourceLocation>;

    fn set_current_location(&mut self, location: Option<SourceLocation>);
}

/// A `'static`, not-necessarily-`Send` future, boxed for storage in a trait-object-safe method
/// signature. Used to hand a word handler's async work (a timer sleep, an accept loop, a
/// connection's read/write loop) to the interpreter's `LocalSet` without the `Interpreter` trait
/// itself needing a generic method (trait objects can't have those).
pub type LoopFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>;

/// Access to the event-loop handle registry, and to the means of queuing events and spawning
/// background work onto the interpreter's `tokio::task::LocalSet` -- see
/// `runtime::built_ins::uv_words` and `vm::Vm::run_event_loop`.
pub trait EventLoopManagement {
    fn handles(&self) -> &HandleRegistry;

    fn handles_mut(&mut self) -> &mut HandleRegistry;

    /// A clone of the channel spawned background tasks use to report events (timer ticks, data
    /// arrival, EOF, accepted/connected sockets) back to the interpreter. Tasks never touch
    /// interpreter state directly -- only this channel -- since they may run while `uv:run` is not
    /// even on the call stack.
    fn event_sender(&self) -> tokio::sync::mpsc::UnboundedSender<LoopEvent>;

    /// Queue a loop event directly, bypassing the channel. Used by native words for events that
    /// originate synchronously rather than from a spawned task.
    fn queue_event(&self, event: LoopEvent);

    /// Spawn a future onto the interpreter's single, persistent `LocalSet`. Valid to call whether
    /// or not `uv:run` is currently driving it: `run_event_loop` always drives that same set
    /// rather than swapping in a fresh one per call, so a task spawned re-entrantly from inside an
    /// event callback is queued onto the very set the in-progress `run_until` is already polling,
    /// and gets driven within that call instead of being silently dropped when the loop returns.
    fn spawn_local(&self, future: LoopFuture) -> tokio::task::JoinHandle<()>;

    /// Run the event loop until every live handle has finished (or been closed), delivering
    /// queued events to their callbacks in arrival order.  Rejects re-entrant calls: a callback
    /// invoked from inside this loop may not itself call `uv:run`.
    fn run_event_loop(&mut self) -> error::Result<()>;
}

/// Whether the interactive prompt loop should keep reading lines. `bye` clears this; nothing else
/// does, and clearing it has no effect on a running event loop -- see SPEC_FULL.md's notes on
/// `bye`'s deliberately limited effect.
pub trait RunControl {
    fn is_running(&self) -> bool;

    fn stop_running(&mut self);
}

/// Everything a native word handler can do to the interpreter.  Deliberately does not include
/// anything resembling the teacher's `CodeManagement`, `ThreadManagement`, or `Ffi` traits: there
/// is no bytecode compiler, no threading, and no foreign-function boundary in this interpreter.
pub trait Interpreter:
    InterpreterStack + WordManagement + Execution + EventLoopManagement + RunControl
{
}

/// An event queued by a background `tokio` task for the interpreter to act on the next time it
/// drives the event loop.  Carries only plain owned data -- never a reference back into
/// interpreter state -- so producing one never needs access to the interpreter itself.
pub enum LoopEvent {
    /// A timer, one-shot or repeating, has ticked.
    Timer { handle: HandleId },

    /// A listening socket accepted a new connection.
    Accepted { listener: HandleId, client: HandleId },

    /// Bytes arrived on a connection with an active read callback. Carried as raw bytes, not
    /// decoded as text -- the connection may carry arbitrary binary data.
    Data { handle: HandleId, data: Vec<u8> },

    /// A connection's read half reached end of stream.
    Eof { handle: HandleId },

    /// An outbound connection attempt completed.
    Connected { handle: HandleId },
}

/// Build a `Token`'s display text for inclusion in an "unknown word" style error message.
pub fn token_text(token: &Token) -> String {
    format!("{}", token)
}

/// Register a native, normal-runtime word.  Mirrors the teacher's macro of the same name:
/// reduces the boilerplate of constructing a `SourceLocation` and wrapping the handler in an
/// `Rc` at every call site in a `register_*_words` function.
#[macro_export]
macro_rules! add_native_word {
    ($interpreter:expr, $name:expr, $handler:expr, $description:expr, $signature:expr) => {
        $interpreter.add_word(
            $crate::location_here!(),
            $name,
            std::rc::Rc::new($handler),
            $description,
            $signature,
            $crate::runtime::data_structures::dictionary::WordRuntime::Normal,
        )
    };
}

/// Register a native, immediate-runtime word -- one that runs even while compiling a colon
/// definition, such as `:` and `;` themselves.
#[macro_export]
macro_rules! add_native_immediate_word {
    ($interpreter:expr, $name:expr, $handler:expr, $description:expr, $signature:expr) => {
        $interpreter.add_word(
            $crate::location_here!(),
            $name,
            std::rc::Rc::new($handler),
            $description,
            $signature,
            $crate::runtime::data_structures::dictionary::WordRuntime::Immediate,
        )
    };
}
