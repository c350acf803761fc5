use crate::{
    lang::source_buffer::SourceLocation,
    runtime::{data_structures::quotation::QuotationId, interpreter::WordHandler},
};
use std::{
    fmt::{self, Display, Formatter},
    rc::Rc,
};

/// When should a word run: as soon as it's found during compilation, or only once the
/// surrounding definition (or top-level statement) is actually executed?
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum WordRuntime {
    /// Executed immediately when encountered, even while compiling a colon definition.
    Immediate,

    /// Executed normally, in whichever mode (compile or immediate) it's looked up.
    Normal,
}

/// What backs a dictionary entry: a native Rust closure, or a colon-defined quotation.
#[derive(Clone)]
pub enum WordBody {
    /// A word implemented directly in Rust.
    Native(Rc<WordHandler>),

    /// A word defined with `:`/`;`, backed by an interned quotation.
    Colon(QuotationId),
}

/// Everything the dictionary keeps about one word.
#[derive(Clone)]
pub struct DictEntry {
    /// Where the word was defined -- in Rust source for native words, in script source for
    /// colon definitions.
    pub location: SourceLocation,

    /// The name the word is looked up by.
    pub name: String,

    /// Compile-time or run-time execution.
    pub runtime: WordRuntime,

    /// The word's implementation.
    pub body: WordBody,

    /// A one-line description, shown by `words`.
    pub description: String,

    /// The word's stack signature, shown by `words`.
    pub signature: String,
}

/// The word dictionary.  A flat, append-only list of entries in definition order.  Lookup scans
/// from the newest entry backwards, so redefining a name shadows the old definition without
/// erasing it -- there is no nested-context mechanism to forget, unlike a scoped dictionary.
#[derive(Default)]
pub struct Dictionary {
    entries: Vec<DictEntry>,
}

impl Dictionary {
    /// Create a new, empty dictionary.
    pub fn new() -> Dictionary {
        Dictionary { entries: Vec::new() }
    }

    /// Append a new entry.  Always added at the end, which lookup treats as "newest."
    pub fn insert(&mut self, entry: DictEntry) {
        self.entries.push(entry);
    }

    /// Find a word by name, preferring the most recently defined entry with that name.
    pub fn find(&self, name: &str) -> Option<&DictEntry> {
        self.entries.iter().rev().find(|entry| entry.name == name)
    }
}

/// Print the dictionary's contents for the `words` primitive: names in newest-first order, the
/// order a user is most likely to care about after a session of redefinitions.
impl Display for Dictionary {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        for entry in self.entries.iter().rev() {
            write!(formatter, "{} ", entry.name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location_here;

    fn dummy_entry(name: &str) -> DictEntry {
        DictEntry {
            location: location_here!(),
            name: name.to_string(),
            runtime: WordRuntime::Normal,
            body: WordBody::Colon(0),
            description: String::new(),
            signature: String::new(),
        }
    }

    #[test]
    fn lookup_prefers_newest_definition() {
        let mut dictionary = Dictionary::new();

        dictionary.insert(dummy_entry("greet"));
        dictionary.insert(dummy_entry("greet"));

        let found = dictionary.find("greet").unwrap();
        assert!(matches!(found.body, WordBody::Colon(_)));
        assert_eq!(dictionary.entries.len(), 2);
    }

    #[test]
    fn lookup_missing_word_is_none() {
        let dictionary = Dictionary::new();
        assert!(dictionary.find("nope").is_none());
    }

    #[test]
    fn display_lists_names_newest_first() {
        let mut dictionary = Dictionary::new();

        dictionary.insert(dummy_entry("a"));
        dictionary.insert(dummy_entry("b"));

        assert_eq!(format!("{}", dictionary), "b a ");
    }
}
