//! Selector discovery over DOM fragments.
//!
//! Tools report candidate interactive elements out of the markup they fetched.
//! Discovery is heuristic: id-attributed interactive tags make strong
//! candidates, class-attributed ones weaker candidates.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::investigation::types::DiscoveredElement;

/// Tags considered interactive for discovery purposes.
const INTERACTIVE_TAGS: &str = "a|button|input|select|textarea|form|label";

static ID_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"<({INTERACTIVE_TAGS})\b[^>]*\bid\s*=\s*"([^"<>]+)""#
    ))
    .unwrap()
});

static CLASS_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"<({INTERACTIVE_TAGS})\b[^>]*\bclass\s*=\s*"([^"<>]+)""#
    ))
    .unwrap()
});

/// Extract candidate elements from an HTML fragment, deduplicated by
/// selector and capped at `max_elements`.
pub fn extract_elements(
    html: &str,
    discovery_method: &str,
    max_elements: usize,
) -> Vec<DiscoveredElement> {
    let mut elements: Vec<DiscoveredElement> = Vec::new();

    for capture in ID_ELEMENT.captures_iter(html) {
        let tag = &capture[1];
        let id = capture[2].trim();
        if id.is_empty() {
            continue;
        }
        push_unique(
            &mut elements,
            DiscoveredElement {
                selector: format!("#{id}"),
                element_type: tag.to_string(),
                confidence: 0.9,
                discovery_method: discovery_method.to_string(),
            },
        );
        if elements.len() >= max_elements {
            return elements;
        }
    }

    for capture in CLASS_ELEMENT.captures_iter(html) {
        let tag = &capture[1];
        let class = match capture[2].split_whitespace().next() {
            Some(first) => first,
            None => continue,
        };
        push_unique(
            &mut elements,
            DiscoveredElement {
                selector: format!("{tag}.{class}"),
                element_type: tag.to_string(),
                confidence: 0.6,
                discovery_method: discovery_method.to_string(),
            },
        );
        if elements.len() >= max_elements {
            break;
        }
    }

    elements
}

fn push_unique(elements: &mut Vec<DiscoveredElement>, candidate: DiscoveredElement) {
    if !elements.iter().any(|e| e.selector == candidate.selector) {
        elements.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_elements_are_preferred_candidates() {
        let html = r#"<div><button id="submit" class="btn">Go</button><input id="email"></div>"#;
        let elements = extract_elements(html, "sub_dom_extraction", 25);

        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].selector, "#submit");
        assert_eq!(elements[0].element_type, "button");
        assert!((elements[0].confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(elements[1].selector, "#email");
        assert_eq!(elements[2].selector, "button.btn");
        assert!((elements[2].confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicates_are_collapsed_and_cap_respected() {
        let html = r#"<a id="home">x</a><a id="home">y</a><a class="nav item">z</a>"#;
        let elements = extract_elements(html, "full_dom_retrieval", 1);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].selector, "#home");

        let all = extract_elements(html, "full_dom_retrieval", 25);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].selector, "a.nav");
    }

    #[test]
    fn non_interactive_tags_are_ignored() {
        let html = r#"<div id="wrapper"><span class="hint">text</span></div>"#;
        let elements = extract_elements(html, "sub_dom_extraction", 25);
        assert!(elements.is_empty());
    }
}
