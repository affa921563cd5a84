//! Ref-based element model: parses an accessibility-tree snapshot (or a
//! DOM-walk fallback) into a flat, stable-for-one-snapshot map from short
//! `e<N>` refs to the locator hints needed to re-resolve each element.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

/// Roles considered clickable/fillable targets in an accessibility tree.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "menuitem",
    "option",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "treeitem",
];

/// Below this many link/button refs, the ARIA snapshot is considered too
/// sparse (common on custom-widget-heavy pages) and the DOM fallback runs.
pub const DOM_FALLBACK_THRESHOLD: usize = 10;

/// Locator hints for a single ref, sufficient to re-resolve the element
/// via the click-by-ref strategy ladder in `controller`.
#[derive(Debug, Clone)]
pub struct RefEntry {
    pub role: String,
    pub name: String,
    /// 0-based occurrence index among same-(role,name) elements.
    pub nth: usize,
    pub tag: Option<String>,
    pub href: Option<String>,
}

/// All refs produced by one snapshot. Valid only until the next snapshot
/// of the same page — by design, no attempt is made to track DOM
/// mutations between snapshots.
#[derive(Debug, Clone, Default)]
pub struct RefMap {
    entries: HashMap<String, RefEntry>,
    order: Vec<String>,
}

impl RefMap {
    pub fn get(&self, a_ref: &str) -> Option<&RefEntry> {
        self.entries.get(a_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refs in snapshot order, for rendering a `snapshot` tool result.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RefEntry)> {
        self.order.iter().map(|k| (k, &self.entries[k]))
    }

    /// Count of refs whose role is `link` or `button` — used to decide
    /// whether the ARIA strategy is rich enough, or the DOM fallback
    /// should run instead.
    pub fn link_button_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.role == "link" || e.role == "button")
            .count()
    }

    fn push(&mut self, a_ref: String, entry: RefEntry) {
        self.order.push(a_ref.clone());
        self.entries.insert(a_ref, entry);
    }

    /// Render as the text block returned by the `snapshot` action.
    pub fn render(&self) -> String {
        self.order
            .iter()
            .map(|r| {
                let e = &self.entries[r];
                format!("[{r}] {} \"{}\"", e.role, e.name)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A line from an accessibility-tree dump, e.g. `  - button "Submit"`.
struct AriaLine {
    indent: usize,
    role: String,
    name: Option<String>,
}

fn parse_aria_line(line: &str, re: &Regex) -> Option<AriaLine> {
    let caps = re.captures(line)?;
    let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
    let role = caps.get(2)?.as_str().to_string();
    let name = caps.get(3).map(|m| m.as_str().to_string());
    Some(AriaLine { indent, role, name })
}

/// Build a `RefMap` from an accessibility-tree text dump where each line
/// looks like `  - role "name" extra...`.
pub fn build_from_aria(tree_text: &str) -> RefMap {
    // Matches "  - role \"name\" trailing" with name optional.
    let re = Regex::new(r#"^(\s*-\s*)(\w+)(?:\s+"([^"]*)")?"#).unwrap();
    let mut map = RefMap::default();
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    let mut n = 0usize;

    for line in tree_text.lines() {
        let Some(parsed) = parse_aria_line(line, &re) else {
            continue;
        };
        if !INTERACTIVE_ROLES.contains(&parsed.role.as_str()) {
            continue;
        }
        let name = parsed.name.unwrap_or_default();
        let key = (parsed.role.clone(), name.clone());
        let nth = *counts
            .entry(key)
            .and_modify(|c| *c += 1)
            .or_insert(0);

        n += 1;
        let a_ref = format!("e{n}");
        map.push(
            a_ref,
            RefEntry {
                role: parsed.role,
                name,
                nth,
                tag: None,
                href: None,
            },
        );
        let _ = parsed.indent;
    }
    map
}

/// Raw node shape returned by the in-page DOM-walk script.
#[derive(Debug, Deserialize)]
pub struct DomNode {
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub href: Option<String>,
}

/// Build a `RefMap` from the DOM-walk fallback's node list, deduplicating
/// by `(tag, first 30 chars of text)` as the reference implementation
/// does, and capping at `max_nodes`.
pub fn build_from_dom(nodes: Vec<DomNode>, max_nodes: usize) -> RefMap {
    let mut map = RefMap::default();
    let mut seen = std::collections::HashSet::new();
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    let mut n = 0usize;

    for node in nodes {
        if n >= max_nodes {
            break;
        }
        let text_key: String = node.text.chars().take(30).collect();
        let dedup_key = (node.tag.clone(), text_key.clone());
        if !seen.insert(dedup_key) {
            continue;
        }

        let role = node
            .role
            .clone()
            .unwrap_or_else(|| default_role_for_tag(&node.tag));
        let key = (role.clone(), text_key.clone());
        let nth = *counts.entry(key).and_modify(|c| *c += 1).or_insert(0);

        n += 1;
        let a_ref = format!("e{n}");
        map.push(
            a_ref,
            RefEntry {
                role,
                name: text_key,
                nth,
                tag: Some(node.tag),
                href: node.href,
            },
        );
    }
    map
}

fn default_role_for_tag(tag: &str) -> String {
    match tag {
        "a" => "link",
        "button" => "button",
        _ => "generic",
    }
    .to_string()
}

/// The in-page JS evaluated for the DOM fallback strategy. Kept as a
/// constant so `controller` can hand it to `Runtime.evaluate` verbatim.
pub const DOM_WALK_SCRIPT: &str = r#"
(() => {
  const sel = 'section.note-item, a, button, [role=button], [role=link], input[type=button], input[type=submit], [onclick], [data-clickable=true]';
  const out = [];
  document.querySelectorAll(sel).forEach((el) => {
    if (!el.offsetParent && el.tagName.toLowerCase() !== 'body') return;
    out.push({
      tag: el.tagName.toLowerCase(),
      role: el.getAttribute('role'),
      text: (el.innerText || el.value || el.getAttribute('aria-label') || '').trim(),
      href: el.getAttribute('href'),
    });
  });
  return JSON.stringify(out);
})()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_aria_tree() {
        let tree = r#"
- generic
  - button "Submit"
  - link "Home"
  - link "Home"
  - textbox "Search"
"#;
        let map = build_from_aria(tree);
        assert_eq!(map.len(), 4);
        let e1 = map.get("e1").unwrap();
        assert_eq!(e1.role, "button");
        assert_eq!(e1.name, "Submit");
        assert_eq!(e1.nth, 0);

        let e2 = map.get("e2").unwrap();
        assert_eq!(e2.name, "Home");
        assert_eq!(e2.nth, 0);

        let e3 = map.get("e3").unwrap();
        assert_eq!(e3.name, "Home");
        assert_eq!(e3.nth, 1, "second occurrence of the same role+name gets nth=1");
    }

    #[test]
    fn ignores_non_interactive_roles() {
        let tree = r#"
- generic
  - heading "Welcome"
  - paragraph "Some text"
  - button "OK"
"#;
        let map = build_from_aria(tree);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("e1").unwrap().role, "button");
    }

    #[test]
    fn link_button_count_used_for_fallback_decision() {
        let tree = r#"
- generic
  - button "OK"
  - textbox "Search"
"#;
        let map = build_from_aria(tree);
        assert_eq!(map.link_button_count(), 1);
        assert!(map.link_button_count() < DOM_FALLBACK_THRESHOLD);
    }

    #[test]
    fn dom_fallback_dedups_by_tag_and_text() {
        let nodes = vec![
            DomNode { tag: "a".into(), role: None, text: "Click me".into(), href: Some("/a".into()) },
            DomNode { tag: "a".into(), role: None, text: "Click me".into(), href: Some("/b".into()) },
            DomNode { tag: "button".into(), role: None, text: "Submit".into(), href: None },
        ];
        let map = build_from_dom(nodes, 50);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn dom_fallback_respects_max_nodes() {
        let nodes: Vec<DomNode> = (0..100)
            .map(|i| DomNode {
                tag: "a".into(),
                role: None,
                text: format!("item-{i}"),
                href: None,
            })
            .collect();
        let map = build_from_dom(nodes, 10);
        assert_eq!(map.len(), 10);
    }
}
