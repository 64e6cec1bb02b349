use std::collections::{BTreeMap, HashMap};

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};

use crate::extract::render::{render_html, render_text};
use crate::model::ChapterContent;

/// Chapter field a rule chain writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Text,
    Html,
}

impl Field {
    pub fn set(self, content: &mut ChapterContent, value: String) {
        let slot = match self {
            Self::Title => &mut content.title,
            Self::Text => &mut content.text,
            Self::Html => &mut content.html,
        };
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Render {
    Text,
    Html,
}

/// One narrowing step. Indexes are zero-based over matching descendants in
/// document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Id(String),
    Class {
        name: String,
        #[serde(default)]
        index: usize,
    },
    Tag {
        name: String,
        #[serde(default)]
        index: usize,
    },
    Select {
        selector: String,
        #[serde(default)]
        index: usize,
    },
    Render(Render),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("rule chain is empty")]
    EmptyChain,

    #[error("rule chain does not end with a render step")]
    NotTerminated,

    #[error("render step at position {0} is not the last step")]
    RenderNotLast(usize),

    #[error("no element with id {0:?}")]
    IdNotFound(String),

    #[error("{kind} {name:?} has no match at index {index} ({found} found)")]
    OutOfRange {
        kind: &'static str,
        name: String,
        index: usize,
        found: usize,
    },

    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("rendered value is empty")]
    EmptyValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub host: String,
    #[serde(default)]
    pub fields: BTreeMap<Field, Vec<Step>>,
}

impl RuleSet {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: Field, steps: Vec<Step>) -> Self {
        self.fields.insert(field, steps);
        self
    }
}

/// Rule sets keyed by host.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    sets: HashMap<String, RuleSet>,
}

impl RuleBook {
    pub fn new(sets: impl IntoIterator<Item = RuleSet>) -> Self {
        let mut book = Self::default();
        for set in sets {
            book.insert(set);
        }
        book
    }

    pub fn insert(&mut self, set: RuleSet) {
        for (field, steps) in &set.fields {
            if let Err(err) = validate_chain(steps) {
                tracing::warn!(host = %set.host, ?field, %err, "rule chain will never resolve");
            }
        }
        self.sets.insert(normalize_host(&set.host), set);
    }

    pub fn lookup(&self, host: &str) -> Option<&RuleSet> {
        self.sets.get(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_owned(),
        None => host,
    }
}

fn validate_chain(steps: &[Step]) -> Result<Render, StepError> {
    let (last, narrowing) = steps.split_last().ok_or(StepError::EmptyChain)?;
    if let Some(position) = narrowing
        .iter()
        .position(|step| matches!(step, Step::Render(_)))
    {
        return Err(StepError::RenderNotLast(position));
    }
    match last {
        Step::Render(render) => Ok(*render),
        _ => Err(StepError::NotTerminated),
    }
}

/// Runs a full chain from `root` and returns the rendered, trimmed value.
pub fn run_chain(root: ElementRef<'_>, steps: &[Step]) -> Result<String, StepError> {
    let render = validate_chain(steps)?;

    let mut current = root;
    for step in &steps[..steps.len() - 1] {
        current = narrow(current, step)?;
    }

    let value = match render {
        Render::Text => render_text(current),
        Render::Html => render_html(current),
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(StepError::EmptyValue);
    }
    Ok(value.to_owned())
}

fn narrow<'a>(current: ElementRef<'a>, step: &Step) -> Result<ElementRef<'a>, StepError> {
    let out_of_range = |kind: &'static str, name: &str, index: usize, found: usize| {
        StepError::OutOfRange {
            kind,
            name: name.to_owned(),
            index,
            found,
        }
    };

    match step {
        Step::Id(id) => nth_descendant(current, 0, |el| el.value().id() == Some(id.as_str()))
            .map_err(|_| StepError::IdNotFound(id.clone())),
        Step::Class { name, index } => nth_descendant(current, *index, |el| {
            el.value().classes().any(|class| class == name.as_str())
        })
        .map_err(|found| out_of_range("class", name, *index, found)),
        Step::Tag { name, index } => nth_descendant(current, *index, |el| {
            el.value().name().eq_ignore_ascii_case(name)
        })
        .map_err(|found| out_of_range("tag", name, *index, found)),
        Step::Select { selector, index } => {
            let parsed = Selector::parse(selector).map_err(|err| StepError::InvalidSelector {
                selector: selector.clone(),
                message: err.to_string(),
            })?;
            let mut matches = current.select(&parsed);
            match matches.nth(*index) {
                Some(el) => Ok(el),
                None => Err(out_of_range(
                    "selector",
                    selector,
                    *index,
                    current.select(&parsed).count(),
                )),
            }
        }
        Step::Render(_) => Err(StepError::RenderNotLast(0)),
    }
}

/// Index-th strict descendant matching `pred`, or the number of matches.
fn nth_descendant<'a>(
    current: ElementRef<'a>,
    index: usize,
    pred: impl Fn(&ElementRef<'a>) -> bool,
) -> Result<ElementRef<'a>, usize> {
    let mut found = 0;
    for el in current.descendants().skip(1).filter_map(ElementRef::wrap) {
        if !pred(&el) {
            continue;
        }
        if found == index {
            return Ok(el);
        }
        found += 1;
    }
    Err(found)
}
