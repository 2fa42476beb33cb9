//! Normalization of native query-plan text into portable [`PlanNode`]s.
//!
//! Translation is lossy and best-effort: each plan line is matched against
//! [`PLAN_RULES`] in order and the first match decides the node type. Lines
//! that match no rule use their first token. The original text is always kept
//! in [`PlanNode::detail`].

use crate::types::PlanNode;

/// How a rule recognizes a plan line (compared case-insensitively)
#[derive(Debug, Clone, Copy)]
pub enum PlanMatcher {
    StartsWith(&'static str),
    Contains(&'static str),
}

impl PlanMatcher {
    fn matches(&self, upper: &str) -> bool {
        match self {
            PlanMatcher::StartsWith(prefix) => upper.starts_with(prefix),
            PlanMatcher::Contains(needle) => upper.contains(needle),
        }
    }
}

/// Ordered rule table; new plan phrases are added here
pub const PLAN_RULES: &[(PlanMatcher, &str)] = &[
    (PlanMatcher::Contains("COVERING INDEX"), "Index Only Scan"),
    (PlanMatcher::StartsWith("SCAN"), "Seq Scan"),
    (PlanMatcher::StartsWith("SEARCH"), "Index Scan"),
    (PlanMatcher::Contains("COMPOUND"), "Compound Query"),
    (PlanMatcher::Contains("ORDER BY"), "Sort"),
    (PlanMatcher::Contains("GROUP BY"), "Aggregate"),
    (PlanMatcher::Contains("TEMP B-TREE"), "Temp B-Tree"),
];

/// Node type for one plan line
pub fn classify_plan_line(detail: &str) -> String {
    let upper = detail.trim().to_ascii_uppercase();
    PLAN_RULES
        .iter()
        .find(|(matcher, _)| matcher.matches(&upper))
        .map(|(_, node_type)| node_type.to_string())
        .unwrap_or_else(|| {
            detail
                .split_whitespace()
                .next()
                .unwrap_or("Unknown")
                .to_string()
        })
}

/// Structured node for one plan line, without children
pub fn normalize_plan_line(detail: &str) -> PlanNode {
    let detail = detail.trim();
    let tokens: Vec<&str> = detail.split_whitespace().collect();

    PlanNode {
        node_type: classify_plan_line(detail),
        relation_name: relation_name(&tokens),
        index_name: index_name(&tokens),
        detail: detail.to_string(),
        children: Vec::new(),
    }
}

fn relation_name(tokens: &[&str]) -> Option<String> {
    let verb = tokens.first()?;
    if !verb.eq_ignore_ascii_case("SCAN") && !verb.eq_ignore_ascii_case("SEARCH") {
        return None;
    }

    let mut rest = tokens[1..].iter();
    let mut candidate = rest.next()?;
    // Older engines print "SCAN TABLE t"
    if candidate.eq_ignore_ascii_case("TABLE") {
        candidate = rest.next()?;
    }
    if candidate.eq_ignore_ascii_case("CONSTANT") || candidate.eq_ignore_ascii_case("SUBQUERY") {
        return None;
    }
    Some(candidate.to_string())
}

fn index_name(tokens: &[&str]) -> Option<String> {
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let using = upper.iter().position(|t| t == "USING")?;

    match upper.get(using + 1).map(String::as_str) {
        Some("INDEX") => tokens.get(using + 2).map(|s| s.to_string()),
        Some("COVERING") if upper.get(using + 2).map(String::as_str) == Some("INDEX") => {
            tokens.get(using + 3).map(|s| s.to_string())
        }
        Some("INTEGER") | Some("PRIMARY") => Some("PRIMARY KEY".to_string()),
        _ => None,
    }
}

/// One row of a native plan that reports `(id, parent, detail)` triples
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub id: i64,
    pub parent: i64,
    pub detail: String,
}

/// Assemble normalized nodes into a tree using parent ids.
///
/// Rows whose parent is not present are roots. Sibling order follows row order.
pub fn build_plan_tree(rows: &[PlanRow]) -> Vec<PlanNode> {
    fn children_of(rows: &[PlanRow], parent: Option<i64>) -> Vec<PlanNode> {
        rows.iter()
            .filter(|row| match parent {
                Some(p) => row.parent == p && row.id != p,
                None => !rows.iter().any(|other| other.id == row.parent && other.id != row.id),
            })
            .map(|row| {
                let mut node = normalize_plan_line(&row.detail);
                node.children = children_of(rows, Some(row.id));
                node
            })
            .collect()
    }

    children_of(rows, None)
}

/// Render plan rows as indented text, the way engine shells print them
pub fn render_plan_text(rows: &[PlanRow]) -> String {
    fn walk(nodes: &[PlanNode], depth: usize, out: &mut Vec<String>) {
        for node in nodes {
            out.push(format!("{}{}", "  ".repeat(depth), node.detail));
            walk(&node.children, depth + 1, out);
        }
    }

    let mut out = Vec::new();
    walk(&build_plan_tree(rows), 0, &mut out);
    out.join("\n")
}
