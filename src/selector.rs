//! CSS subset evaluated against a [`DomSnapshot`].
//!
//! Supports type selectors, `#id`, `.class`, `[attr]`, `[attr="value"]`,
//! `:nth-of-type(n)` and the descendant and child combinators. This covers every
//! selector the extractor generates, so the same locator works on a live page
//! (`querySelectorAll`) and on a snapshot.

use anyhow::{Result, bail};
use std::fmt;

use crate::page::DomSnapshot;
use crate::types::{Selector, SelectorStrategy, escape_attr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    Id(String),
    Class(String),
    Attr { name: String, value: Option<String> },
    NthOfType(usize),
}

impl Qualifier {
    /// Relaxation order: positional first, then id, class, attributes
    fn relax_rank(&self) -> u8 {
        match self {
            Qualifier::NthOfType(_) => 4,
            Qualifier::Id(_) => 3,
            Qualifier::Attr { name, .. } if name == "id" => 3,
            Qualifier::Class(_) => 2,
            Qualifier::Attr { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compound {
    pub tag: Option<String>,
    pub qualifiers: Vec<Qualifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Descendant,
    Child,
}

/// A parsed selector: compounds joined by combinators, subject last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexSelector {
    /// The combinator of the first compound is ignored
    pub parts: Vec<(Combinator, Compound)>,
}

impl ComplexSelector {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser {
            chars: input.trim().chars().collect(),
            pos: 0,
        };
        parser.complex()
    }

    pub fn matches(&self, dom: &DomSnapshot, idx: usize) -> bool {
        matches_from(&self.parts, self.parts.len() - 1, dom, idx)
    }

    /// A less specific variant, or `None` once nothing more can be dropped.
    ///
    /// The subject keeps its tag; qualifiers go first (highest rank, rightmost
    /// first), then ancestor compounds from the left.
    pub fn relax(&self) -> Option<ComplexSelector> {
        let mut best: Option<(u8, usize, usize)> = None;
        for (p, (_, compound)) in self.parts.iter().enumerate() {
            for (q, qualifier) in compound.qualifiers.iter().enumerate() {
                let rank = qualifier.relax_rank();
                if best.is_none_or(|(r, bp, bq)| rank > r || (rank == r && (p, q) > (bp, bq))) {
                    best = Some((rank, p, q));
                }
            }
        }

        let mut relaxed = self.clone();
        if let Some((_, p, q)) = best {
            relaxed.parts[p].1.qualifiers.remove(q);
            if relaxed.parts[p].1.tag.is_none()
                && relaxed.parts[p].1.qualifiers.is_empty()
                && p + 1 < relaxed.parts.len()
            {
                relaxed.parts.remove(p);
            }
            return Some(relaxed);
        }
        if relaxed.parts.len() > 1 {
            relaxed.parts.remove(0);
            return Some(relaxed);
        }
        None
    }

    /// Whether the subject carries anything beyond a bare tag
    pub fn is_bare(&self) -> bool {
        self.parts.len() == 1 && self.parts[0].1.qualifiers.is_empty()
    }
}

impl fmt::Display for ComplexSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (combinator, compound)) in self.parts.iter().enumerate() {
            if i > 0 {
                match combinator {
                    Combinator::Child => f.write_str(" > ")?,
                    Combinator::Descendant => f.write_str(" ")?,
                }
            }
            write!(f, "{}", compound)?;
        }
        Ok(())
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => f.write_str(tag)?,
            None if self.qualifiers.is_empty() => f.write_str("*")?,
            None => {}
        }
        for q in &self.qualifiers {
            match q {
                Qualifier::Id(id) => write!(f, "#{}", id)?,
                Qualifier::Class(class) => write!(f, ".{}", class)?,
                Qualifier::Attr { name, value: None } => write!(f, "[{}]", name)?,
                Qualifier::Attr {
                    name,
                    value: Some(v),
                } => write!(f, "[{}=\"{}\"]", name, escape_attr(v))?,
                Qualifier::NthOfType(n) => write!(f, ":nth-of-type({})", n)?,
            }
        }
        Ok(())
    }
}

fn matches_from(parts: &[(Combinator, Compound)], k: usize, dom: &DomSnapshot, idx: usize) -> bool {
    if !compound_matches(&parts[k].1, dom, idx) {
        return false;
    }
    if k == 0 {
        return true;
    }
    match parts[k].0 {
        Combinator::Child => dom
            .node(idx)
            .parent
            .is_some_and(|p| matches_from(parts, k - 1, dom, p)),
        Combinator::Descendant => dom
            .ancestors(idx)
            .any(|a| matches_from(parts, k - 1, dom, a)),
    }
}

fn compound_matches(compound: &Compound, dom: &DomSnapshot, idx: usize) -> bool {
    let node = dom.node(idx);
    if let Some(tag) = &compound.tag
        && tag != &node.tag
    {
        return false;
    }
    compound.qualifiers.iter().all(|q| match q {
        Qualifier::Id(id) => node.attr("id") == Some(id.as_str()),
        Qualifier::Class(class) => node.classes().any(|c| c == class),
        Qualifier::Attr { name, value } => match value {
            None => node.has_attr(name),
            Some(v) => node.attr(name) == Some(v.as_str()),
        },
        Qualifier::NthOfType(n) => nth_of_type(dom, idx) == *n,
    })
}

/// 1-based position of a node among siblings sharing its tag
pub fn nth_of_type(dom: &DomSnapshot, idx: usize) -> usize {
    let node = dom.node(idx);
    let siblings: Box<dyn Iterator<Item = usize> + '_> = match node.parent {
        Some(p) => Box::new(dom.children(p)),
        None => Box::new((0..dom.len()).filter(|&i| dom.node(i).parent.is_none())),
    };
    siblings
        .filter(|&s| dom.node(s).tag == node.tag)
        .position(|s| s == idx)
        .map(|p| p + 1)
        .unwrap_or(1)
}

/// Nodes matching a selector. Unparsable CSS matches nothing.
pub fn query(dom: &DomSnapshot, selector: &Selector) -> Vec<usize> {
    match selector.strategy {
        SelectorStrategy::Id => (0..dom.len())
            .filter(|&i| dom.node(i).attr("id") == Some(selector.locator.as_str()))
            .collect(),
        SelectorStrategy::Name => (0..dom.len())
            .filter(|&i| dom.node(i).attr("name") == Some(selector.locator.as_str()))
            .collect(),
        SelectorStrategy::Css => match ComplexSelector::parse(&selector.locator) {
            Ok(complex) => (0..dom.len()).filter(|&i| complex.matches(dom, i)).collect(),
            Err(_) => Vec::new(),
        },
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn complex(&mut self) -> Result<ComplexSelector> {
        let mut parts = vec![(Combinator::Descendant, self.compound()?)];
        loop {
            let had_ws = self.skip_ws();
            match self.peek() {
                None => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    parts.push((Combinator::Child, self.compound()?));
                }
                Some(_) if had_ws => parts.push((Combinator::Descendant, self.compound()?)),
                Some(c) => bail!("Unexpected '{}' in selector at {}", c, self.pos),
            }
        }
        Ok(ComplexSelector { parts })
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            bail!("Expected identifier in selector at {}", start);
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn compound(&mut self) -> Result<Compound> {
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => self.pos += 1,
            Some(c) if c.is_alphabetic() => compound.tag = Some(self.ident()?.to_lowercase()),
            _ => {}
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.qualifiers.push(Qualifier::Id(self.ident()?));
                }
                Some('.') => {
                    self.pos += 1;
                    compound.qualifiers.push(Qualifier::Class(self.ident()?));
                }
                Some('[') => {
                    self.pos += 1;
                    compound.qualifiers.push(self.attribute()?);
                }
                Some(':') => {
                    self.pos += 1;
                    let pseudo = self.ident()?;
                    if pseudo != "nth-of-type" || self.peek() != Some('(') {
                        bail!("Unsupported pseudo-class :{}", pseudo);
                    }
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    let n: usize = self.chars[start..self.pos].iter().collect::<String>().parse()?;
                    if self.peek() != Some(')') {
                        bail!("Unterminated :nth-of-type");
                    }
                    self.pos += 1;
                    compound.qualifiers.push(Qualifier::NthOfType(n));
                }
                _ => break,
            }
        }
        if compound.tag.is_none() && compound.qualifiers.is_empty() && self.pos > 0 {
            // Only `*` was consumed
            if self.chars.get(self.pos - 1) != Some(&'*') {
                bail!("Empty compound selector at {}", self.pos);
            }
        } else if compound.tag.is_none() && compound.qualifiers.is_empty() {
            bail!("Empty selector");
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<Qualifier> {
        self.skip_ws();
        let name = self.ident()?.to_lowercase();
        self.skip_ws();
        let value = match self.peek() {
            Some(']') => None,
            Some('=') => {
                self.pos += 1;
                self.skip_ws();
                Some(self.attr_value()?)
            }
            _ => bail!("Unsupported attribute operator in selector"),
        };
        self.skip_ws();
        if self.peek() != Some(']') {
            bail!("Unterminated attribute selector");
        }
        self.pos += 1;
        Ok(Qualifier::Attr { name, value })
    }

    fn attr_value(&mut self) -> Result<String> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.peek() {
                        None => bail!("Unterminated string in selector"),
                        Some('\\') => {
                            self.pos += 1;
                            if let Some(c) = self.peek() {
                                value.push(c);
                                self.pos += 1;
                            }
                        }
                        Some(c) if c == quote => {
                            self.pos += 1;
                            return Ok(value);
                        }
                        Some(c) => {
                            value.push(c);
                            self.pos += 1;
                        }
                    }
                }
            }
            _ => self.ident(),
        }
    }
}
