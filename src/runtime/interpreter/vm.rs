use crate::{
    lang::{
        source_buffer::SourceLocation,
        tokenizing::{Token, TokenList},
    },
    runtime::{
        data_structures::{
            dictionary::{DictEntry, Dictionary, WordBody, WordRuntime},
            quotation::{QuotationId, QuotationStore},
            value::Value,
        },
        error::{self, script_error_str},
        handle::{HandleId, HandleRegistry},
        interpreter::{
            CallItem, CallStack, Execution, Interpreter, InterpreterStack, LoopEvent, LoopFuture,
            RunControl, ValueStack, WordHandler, WordManagement,
        },
    },
};
use std::rc::Rc;
use tokio::{sync::mpsc, task::LocalSet};

/// The interpreter proper: the data stack, dictionary, quotation store, handle registry, and the
/// `tokio` plumbing (a current-thread runtime plus the `LocalSet` every spawned word handler's
/// background task lives on) bundled into one owned value.
///
/// Everything here is intentionally `!Send`/`!Sync` -- `Dictionary`, `QuotationStore`, and the
/// value stack are plain owned collections, and `HandleRegistry` is `Rc<RefCell<_>>`-backed. There
/// is exactly one of these per process, matching SPEC_FULL.md §5's single-thread, cooperative
/// model.
pub struct Vm {
    stack: ValueStack,
    dictionary: Dictionary,
    quotations: QuotationStore,
    handles: HandleRegistry,
    call_stack: CallStack,
    current_location: Option<SourceLocation>,

    /// `true` while between a `:` and its matching `;`.
    compiling: bool,

    /// The name being defined, set by `:` and consumed by `;`.
    compile_name: Option<String>,

    /// Where the definition in progress was opened, for the dictionary entry's `location` field.
    compile_location: Option<SourceLocation>,

    /// The body accumulated so far for the definition in progress.
    current_quote: Option<TokenList>,

    /// Cleared by `bye`; read by the REPL loop in `main`.
    running: bool,

    /// Kept alive for the process's whole lifetime -- dropping it would shut down the reactor
    /// backing every timer and socket. Never otherwise touched; see `handle` for the cheap,
    /// `Clone`-able way to actually enter it.
    _runtime: tokio::runtime::Runtime,

    /// A clone of `_runtime.handle()`, used to drive the `LocalSet` from `run_event_loop` without
    /// needing to borrow `_runtime` itself (which would conflict with the `&mut self` borrow the
    /// driven future also needs).
    handle: tokio::runtime::Handle,

    /// Where every word handler's background task (timer sleep, accept loop, connection
    /// read/write loop) actually lives. A single set for the interpreter's whole lifetime, held
    /// behind `Rc` so `run_event_loop` can clone it out (a cheap pointer clone) before calling
    /// `self.drive()`, which needs `&mut self` and would otherwise conflict with a borrow of this
    /// field. Crucially this is the *same* set on every call to `run_event_loop`, never a fresh
    /// one swapped in for the duration -- a task spawned re-entrantly from inside an event
    /// callback (e.g. the close-timer a `uv:listen` callback arms) lands in the set the
    /// in-progress `run_until` is already polling, instead of a throwaway set nothing ever drives.
    local: Rc<LocalSet>,

    /// The sending half handed out to background tasks via `event_sender()`.
    event_tx: mpsc::UnboundedSender<LoopEvent>,

    /// The receiving half drained by `run_event_loop`.
    event_rx: mpsc::UnboundedReceiver<LoopEvent>,

    /// Set for the duration of `run_event_loop`, so a callback quotation that itself calls
    /// `uv:run` gets a fatal error instead of silently nesting.
    loop_running: bool,
}

impl Vm {
    /// Build a fresh interpreter with an empty stack and dictionary, and its own current-thread
    /// `tokio` runtime. Native words still need to be registered by the caller -- see
    /// `runtime::built_ins`.
    pub fn new() -> error::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Vm {
            stack: ValueStack::new(),
            dictionary: Dictionary::new(),
            quotations: QuotationStore::new(),
            handles: HandleRegistry::new(),
            call_stack: CallStack::new(),
            current_location: None,
            compiling: false,
            compile_name: None,
            compile_location: None,
            current_quote: None,
            running: true,
            _runtime: runtime,
            handle,
            local: Rc::new(LocalSet::new()),
            event_tx,
            event_rx,
            loop_running: false,
        })
    }

    /// The quotation store, for diagnostics and for `execute_quotation`'s own use.
    pub fn quotations(&self) -> &QuotationStore {
        &self.quotations
    }

    /// Deliver one queued event to its owning handle's callback, if it still has one and hasn't
    /// been closed out from under it.
    fn dispatch_event(&mut self, event: LoopEvent) -> error::Result<()> {
        match event {
            LoopEvent::Timer { handle } => self.invoke_callback(handle, &[Value::Handle(handle)]),

            LoopEvent::Accepted { listener, client } => {
                self.invoke_callback(listener, &[Value::Handle(client)])
            }

            LoopEvent::Data { handle, data } => {
                self.invoke_callback(handle, &[Value::Handle(handle), Value::String(data)])
            }

            LoopEvent::Eof { handle } => self
                .invoke_callback(handle, &[Value::Handle(handle), Value::String(Vec::new())]),

            LoopEvent::Connected { handle } => {
                self.invoke_callback(handle, &[Value::Handle(handle)])
            }
        }
    }

    /// Push `args` in order, then run `owner`'s armed callback quotation, if it's still armed and
    /// the handle hasn't since been closed.
    fn invoke_callback(&mut self, owner: HandleId, args: &[Value]) -> error::Result<()> {
        if self.handles.is_closed(owner).unwrap_or(true) {
            return Ok(());
        }

        let Some(quote) = self.handles.callback(owner) else {
            return Ok(());
        };

        for arg in args {
            self.push(arg.clone());
        }

        self.execute_quotation(quote)
    }

    /// Drive the `LocalSet` (and, through it, every spawned background task) until no handle
    /// reports itself active, delivering queued events to callbacks as they arrive.
    async fn drive(&mut self) -> error::Result<()> {
        let mut idle_check = tokio::time::interval(std::time::Duration::from_millis(10));

        loop {
            if !self.handles.has_active() {
                return Ok(());
            }

            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.dispatch_event(event)?,
                        None => return Ok(()),
                    }
                }

                _ = idle_check.tick() => {
                    // No event arrived in the last tick; loop back around to re-check
                    // `has_active()` in case a task finished (EOF, connect failure, one-shot
                    // timer) without ever sending one.
                }
            }
        }
    }
}

impl InterpreterStack for Vm {
    fn stack(&self) -> &ValueStack {
        &self.stack
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> error::Result<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => script_error_str(&*self, "Data stack underflow."),
        }
    }

    fn pop_as_int(&mut self) -> error::Result<i64> {
        let value = self.pop()?;
        value.as_int(&*self)
    }

    fn pop_as_string(&mut self) -> error::Result<Vec<u8>> {
        let value = self.pop()?;
        value.as_bytes(&*self).map(|bytes| bytes.clone())
    }

    fn pop_as_quote(&mut self) -> error::Result<QuotationId> {
        let value = self.pop()?;
        value.as_quote(&*self)
    }

    fn pop_as_handle(&mut self) -> error::Result<HandleId> {
        let value = self.pop()?;
        value.as_handle(&*self)
    }
}

impl WordManagement for Vm {
    fn add_word(
        &mut self,
        location: SourceLocation,
        name: &str,
        handler: Rc<WordHandler>,
        description: &str,
        signature: &str,
        runtime: WordRuntime,
    ) {
        self.dictionary.insert(DictEntry {
            location,
            name: name.to_string(),
            runtime,
            body: WordBody::Native(handler),
            description: description.to_string(),
            signature: signature.to_string(),
        });
    }

    fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    fn execute_word_named(&mut self, location: &SourceLocation, name: &str) -> error::Result<()> {
        if let Some(number) = crate::lang::tokenizing::parse_number(name) {
            self.push(Value::Int(number));
            return Ok(());
        }

        let entry = match self.dictionary.find(name) {
            Some(entry) => entry.clone(),
            None => return script_error_str(&*self, &format!("Unknown word '{}'.", name)),
        };

        self.call_stack.push(CallItem { name: name.to_string(), location: location.clone() });

        let result = match entry.body {
            WordBody::Native(handler) => handler(self),
            WordBody::Colon(id) => self.execute_quotation(id),
        };

        self.call_stack.pop();

        result
    }

    fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }
}

impl Execution for Vm {
    fn interpret_tokens(&mut self, tokens: &TokenList) -> error::Result<()> {
        let mut index = 0;

        while index < tokens.len() {
            let token = tokens[index].clone();
            self.set_current_location(Some(token.location().clone()));

            if self.compiling {
                index = self.step_compile(tokens, index, &token)?;
            } else {
                index = self.step_immediate(tokens, index, &token)?;
            }
        }

        Ok(())
    }

    fn execute_quotation(&mut self, id: QuotationId) -> error::Result<()> {
        let tokens = self.quotations.get(id).tokens().clone();
        self.interpret_tokens(&tokens)
    }

    fn current_location(&self) -> &Option<SourceLocation> {
        &self.current_location
    }

    fn set_current_location(&mut self, location: Option<SourceLocation>) {
        self.current_location = location;
    }
}

impl Vm {
    /// One step of the immediate-mode table in SPEC_FULL.md §4.3. Returns the index to resume at.
    fn step_immediate(
        &mut self,
        tokens: &TokenList,
        index: usize,
        token: &Token,
    ) -> error::Result<usize> {
        match token {
            Token::Word(location, word) if word == ":" => {
                let name_index = index + 1;
                let name_token = tokens.get(name_index);

                let name = match name_token {
                    Some(Token::Word(_, name)) => name.clone(),
                    _ => {
                        return script_error_str(
                            &*self,
                            "Expected a word name to follow ':'.",
                        );
                    }
                };

                self.compile_location = Some(location.clone());
                self.compile_name = Some(name);
                self.current_quote = Some(TokenList::new());
                self.compiling = true;

                Ok(name_index + 1)
            }

            Token::Word(_, word) if word == "[" => {
                let (inner, next_index) = capture_bracket(&*self, tokens, index + 1)?;
                let id = self.quotations.intern(inner);
                self.push(Value::Quote(id));
                Ok(next_index)
            }

            Token::Word(_, word) if word == "]" => {
                script_error_str(&*self, "Unexpected ']' with no matching '['.")
            }

            Token::Word(_, word) if word == ";" => {
                script_error_str(&*self, "Unexpected ';' outside of a colon definition.")
            }

            Token::Word(location, word) => {
                self.execute_word_named(location, word)?;
                Ok(index + 1)
            }

            Token::Str(_, text) => {
                self.push(Value::String(text.clone().into_bytes()));
                Ok(index + 1)
            }

            Token::QuoteRef(_, id) => {
                self.push(Value::Quote(*id));
                Ok(index + 1)
            }
        }
    }

    /// One step of the compile-mode table in SPEC_FULL.md §4.3. Returns the index to resume at.
    fn step_compile(
        &mut self,
        tokens: &TokenList,
        index: usize,
        token: &Token,
    ) -> error::Result<usize> {
        match token {
            Token::Word(_, word) if word == ";" => {
                let body = self.current_quote.take().unwrap_or_default();
                let name = self.compile_name.take().unwrap_or_default();
                let location = self.compile_location.take().unwrap_or_default();
                let id = self.quotations.intern(body);

                self.dictionary.insert(DictEntry {
                    location,
                    name,
                    runtime: WordRuntime::Normal,
                    body: WordBody::Colon(id),
                    description: String::new(),
                    signature: String::new(),
                });

                self.compiling = false;
                Ok(index + 1)
            }

            Token::Word(location, word) if word == "[" => {
                let (inner, next_index) = capture_bracket(&*self, tokens, index + 1)?;
                let id = self.quotations.intern(inner);

                self.current_quote
                    .get_or_insert_with(TokenList::new)
                    .push(Token::QuoteRef(location.clone(), id));

                Ok(next_index)
            }

            Token::Word(_, word) if word == "]" => {
                script_error_str(&*self, "Unexpected ']' with no matching '['.")
            }

            Token::Word(_, word) if word == ":" => {
                script_error_str(&*self, "Nested colon definitions are not allowed.")
            }

            other => {
                self.current_quote.get_or_insert_with(TokenList::new).push(other.clone());
                Ok(index + 1)
            }
        }
    }
}

/// Scan forward from just past an opening `[` to its matching `]`, respecting nesting, and return
/// the tokens found strictly between them along with the index just past the matching `]`. An
/// unmatched `[` is fatal.
fn capture_bracket(
    interpreter: &dyn Interpreter,
    tokens: &TokenList,
    start: usize,
) -> error::Result<(TokenList, usize)> {
    let mut depth: usize = 1;
    let mut inner = TokenList::new();
    let mut index = start;

    while index < tokens.len() {
        let token = &tokens[index];
        let is_open = matches!(token, Token::Word(_, word) if word == "[");
        let is_close = matches!(token, Token::Word(_, word) if word == "]");

        if is_close {
            depth -= 1;
            index += 1;

            if depth == 0 {
                return Ok((inner, index));
            }

            inner.push(token.clone());
            continue;
        }

        if is_open {
            depth += 1;
        }

        inner.push(token.clone());
        index += 1;
    }

    script_error_str(interpreter, "Unterminated '[' -- no matching ']' found.")
}

impl crate::runtime::interpreter::EventLoopManagement for Vm {
    fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    fn handles_mut(&mut self) -> &mut HandleRegistry {
        &mut self.handles
    }

    fn event_sender(&self) -> mpsc::UnboundedSender<LoopEvent> {
        self.event_tx.clone()
    }

    fn queue_event(&self, event: LoopEvent) {
        // A closed receiver means the interpreter is already tearing down; nothing to do.
        let _ = self.event_tx.send(event);
    }

    fn spawn_local(&self, future: LoopFuture) -> tokio::task::JoinHandle<()> {
        self.local.spawn_local(future)
    }

    fn run_event_loop(&mut self) -> error::Result<()> {
        if self.loop_running {
            return script_error_str(
                &*self,
                "uv:run called re-entrantly from inside an event callback.",
            );
        }

        self.loop_running = true;

        // Clone the `Rc`, not the set: this is the same `LocalSet` every call shares, so tasks
        // spawned while this `run_until` is in flight (including from inside a callback it
        // invokes) are queued onto the set already being driven, not a fresh one nothing polls.
        // The clone only exists so `local.run_until(..)`'s borrow of it doesn't overlap the
        // `&mut self` borrow `self.drive()` needs.
        let local = self.local.clone();
        let handle = self.handle.clone();

        let outcome = handle.block_on(local.run_until(self.drive()));

        self.loop_running = false;

        outcome
    }
}

impl RunControl for Vm {
    fn is_running(&self) -> bool {
        self.running
    }

    fn stop_running(&mut self) {
        self.running = false;
    }
}

impl Interpreter for Vm {}

#[cfg(test)]
mod tests {
    use super::Vm;
    use crate::{
        lang::tokenizing::tokenize_from_source,
        runtime::interpreter::{Execution, InterpreterStack},
    };

    fn interpret(vm: &mut Vm, source: &str) {
        let tokens = tokenize_from_source("<test>", source).expect("tokenize failed");
        vm.interpret_tokens(&tokens).expect("interpret failed");
    }

    #[test]
    fn dup_on_a_quotation_shares_the_same_id() {
        let mut vm = Vm::new().expect("vm construction failed");
        interpret(&mut vm, "[ 1 2 3 ] dup");

        let second = vm.pop_as_quote().expect("expected a quotation");
        let first = vm.pop_as_quote().expect("expected a quotation");

        assert_eq!(first, second);
    }

    #[test]
    fn two_separate_bracket_literals_get_different_ids() {
        let mut vm = Vm::new().expect("vm construction failed");
        interpret(&mut vm, "[ 1 ] [ 1 ]");

        let second = vm.pop_as_quote().expect("expected a quotation");
        let first = vm.pop_as_quote().expect("expected a quotation");

        assert_ne!(first, second);
    }
}
