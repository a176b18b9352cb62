//! The service tree: a trie of named nodes with handlers, wildcard and virtual matching, and
//! name-ordered children (spec.md §3 "Service node", §4.5 "Service tree and server").

use crate::error::Error;
use crate::error::Result;
use crate::server::Session;
use crate::spath::split_component_options;

/// A handler invoked once a dial request has matched a node. Handlers signal completion through
/// [`Session::exit`]/[`Session::fatal`] rather than a return value; a handler that returns
/// without exiting falls through to the dispatcher's default behavior (spec.md §4.5 step 7).
pub type Handler = Box<dyn Fn(&mut Session) + Send + Sync>;

/// A node in the service tree.
pub struct ServiceNode {
    name: String,
    handler: Option<Handler>,
    help_text: Option<String>,
    autoanswer: bool,
    is_virtual: bool,
    is_wildcard: bool,
    children: Vec<ServiceNode>,
}

impl ServiceNode {
    /// A plain named node with no handler and the default flags (`autoanswer = true`, not
    /// virtual, not wildcard).
    pub fn new(name: impl Into<String>) -> ServiceNode {
        ServiceNode {
            name: name.into(),
            handler: None,
            help_text: None,
            autoanswer: true,
            is_virtual: false,
            is_wildcard: false,
            children: Vec::new(),
        }
    }

    /// The unnamed root of a service tree.
    pub fn root() -> ServiceNode {
        ServiceNode::new("")
    }

    pub fn with_handler<F>(mut self, handler: F) -> ServiceNode
    where
        F: Fn(&mut Session) + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Marks this node wildcard: it is named `*` and matches any single path component when no
    /// exact-name sibling matches (spec.md §4.5 "Lookup"; wildcards never shadow an exact name).
    pub fn wildcard(mut self) -> ServiceNode {
        self.is_wildcard = true;
        self.name = "*".to_string();
        self
    }

    /// Marks this node virtual: matching stops here even if more path components remain, and the
    /// unmatched remainder is handed to the handler instead of being looked up further (spec.md
    /// §4.5, GLOSSARY "Virtual node"). Also suppresses the default list/help fallback.
    pub fn virtual_node(mut self) -> ServiceNode {
        self.is_virtual = true;
        self
    }

    pub fn autoanswer(mut self, autoanswer: bool) -> ServiceNode {
        self.autoanswer = autoanswer;
        self
    }

    pub fn help(mut self, text: impl Into<String>) -> ServiceNode {
        self.help_text = Some(text.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    pub fn autoanswer_enabled(&self) -> bool {
        self.autoanswer
    }

    pub fn help_text(&self) -> Option<&str> {
        self.help_text.as_deref()
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn children(&self) -> &[ServiceNode] {
        &self.children
    }

    /// Inserts `child` in name order (spec.md §4.5 "Insertion"). Fails if a child with the same
    /// name already exists.
    pub fn add_child(&mut self, child: ServiceNode) -> Result<&mut ServiceNode> {
        if self.children.iter().any(|c| c.name == child.name) {
            return Err(Error::DuplicateServiceName(
                self.name.clone(),
                child.name.clone(),
            ));
        }
        let idx = self
            .children
            .partition_point(|c| c.name.as_str() < child.name.as_str());
        self.children.insert(idx, child);
        Ok(&mut self.children[idx])
    }

    /// Consumes path components of `remaining` one at a time, preferring an exact name match and
    /// falling back to a wildcard child, stopping at a virtual node or when the path is
    /// exhausted (spec.md §4.5 "Lookup").
    ///
    /// Returns the matched node, the spath prefix that was consumed to reach it (always starting
    /// with `/`), and whatever of `remaining` was left unconsumed (likewise `/`-prefixed, or
    /// exactly `/` if nothing remains).
    pub fn find<'a>(&'a self, remaining: &str) -> (&'a ServiceNode, String, String) {
        let mut node = self;
        let mut matched: Vec<String> = Vec::new();
        let mut rest = remaining.to_string();

        loop {
            if node.is_virtual {
                break;
            }
            let trimmed = rest.trim_start_matches('/').to_string();
            if trimmed.is_empty() {
                rest = String::new();
                break;
            }
            let (component, tail) = match trimmed.find('/') {
                Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
                None => (trimmed.clone(), String::new()),
            };
            let (name, _options) = split_component_options(&component);
            let exact = node
                .children
                .iter()
                .find(|c| !c.is_wildcard && c.name == name);
            let chosen = exact.or_else(|| node.children.iter().find(|c| c.is_wildcard));
            match chosen {
                Some(child) => {
                    node = child;
                    matched.push(component);
                    rest = tail;
                }
                None => {
                    rest = trimmed;
                    break;
                }
            }
        }

        let captured = format!("/{}", matched.join("/"));
        let remainder = if rest.is_empty() {
            "/".to_string()
        } else {
            format!("/{rest}")
        };
        (node, captured, remainder)
    }
}
