// =============================================================================
// Signal-Config DSL — condition grammar for buy/sell rules
// =============================================================================
//
// Grammar:
//
//   config      := group ('|' group)*
//   group       := '(' condList ')' ('/' N)? | condList
//   condList    := cond (',' cond)*
//   cond        := indicator op number
//   indicator   := 'RSI' ':' period | 'PSY' ':' period
//                | 'MFI' | 'K' | 'D' | 'J' | 'MACD' | 'DIF' | 'DEA'
//   op          := '<' | '>' | '<=' | '>=' | '==' | '!='
//
// A group is satisfied when at least N of its conditions hold (N defaults to
// all of them). The config triggers when any group is satisfied.
//
// Example: "(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)"
// =============================================================================

use anyhow::{anyhow, bail, Context, Result};

// ---------------------------------------------------------------------------
// Indicator fields
// ---------------------------------------------------------------------------

/// An indicator slot a condition or verification rule can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorField {
    Rsi(u32),
    Psy(u32),
    Mfi,
    K,
    D,
    J,
    Macd,
    Dif,
    Dea,
}

impl IndicatorField {
    /// Parse a field name as it appears in the DSL and in verification
    /// indicator lists, e.g. `RSI:6`, `J`, `MACD`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("RSI:") {
            let period: u32 = rest
                .parse()
                .with_context(|| format!("invalid RSI period '{rest}'"))?;
            return Ok(Self::Rsi(period));
        }
        if let Some(rest) = s.strip_prefix("PSY:") {
            let period: u32 = rest
                .parse()
                .with_context(|| format!("invalid PSY period '{rest}'"))?;
            return Ok(Self::Psy(period));
        }
        match s {
            "MFI" => Ok(Self::Mfi),
            "K" => Ok(Self::K),
            "D" => Ok(Self::D),
            "J" => Ok(Self::J),
            "MACD" => Ok(Self::Macd),
            "DIF" => Ok(Self::Dif),
            "DEA" => Ok(Self::Dea),
            other => bail!("unknown indicator '{other}'"),
        }
    }
}

impl std::fmt::Display for IndicatorField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsi(p) => write!(f, "RSI:{p}"),
            Self::Psy(p) => write!(f, "PSY:{p}"),
            Self::Mfi => write!(f, "MFI"),
            Self::K => write!(f, "K"),
            Self::D => write!(f, "D"),
            Self::J => write!(f, "J"),
            Self::Macd => write!(f, "MACD"),
            Self::Dif => write!(f, "DIF"),
            Self::Dea => write!(f, "DEA"),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Gt => lhs > rhs,
            Self::Le => lhs <= rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: IndicatorField,
    pub op: CmpOp,
    pub value: f64,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.field, self.op.as_str(), self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    pub conditions: Vec<Condition>,
    /// Minimum number of satisfied conditions for the group to trigger.
    pub threshold: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalRule {
    pub groups: Vec<ConditionGroup>,
}

/// Result of evaluating a rule against one snapshot: which group fired and
/// how many of its conditions matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMatch {
    pub group_index: usize,
    pub matched: usize,
    pub threshold: usize,
    pub total: usize,
}

/// The snapshot surface the evaluator reads from. Implemented by
/// `pipeline::IndicatorSnapshot`; kept as a trait so the parser has no
/// dependency on the pipeline.
pub trait IndicatorSource {
    fn indicator(&self, field: &IndicatorField) -> Option<f64>;
}

impl SignalRule {
    /// Parse a complete signal config.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            bail!("empty signal config");
        }

        let groups = input
            .split('|')
            .map(parse_group)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { groups })
    }

    /// Evaluate against a snapshot. Returns the first satisfied group, if
    /// any. A condition whose indicator is unavailable counts as unmatched.
    pub fn evaluate<S: IndicatorSource>(&self, source: &S) -> Option<GroupMatch> {
        for (group_index, group) in self.groups.iter().enumerate() {
            let matched = group
                .conditions
                .iter()
                .filter(|cond| {
                    source
                        .indicator(&cond.field)
                        .map(|v| cond.op.apply(v, cond.value))
                        .unwrap_or(false)
                })
                .count();

            if matched >= group.threshold {
                return Some(GroupMatch {
                    group_index,
                    matched,
                    threshold: group.threshold,
                    total: group.conditions.len(),
                });
            }
        }
        None
    }

    /// Every field referenced by any condition, deduplicated in first-seen
    /// order. Drives which indicator periods the pipeline computes.
    pub fn referenced_fields(&self) -> Vec<IndicatorField> {
        let mut out: Vec<IndicatorField> = Vec::new();
        for group in &self.groups {
            for cond in &group.conditions {
                if !out.contains(&cond.field) {
                    out.push(cond.field);
                }
            }
        }
        out
    }
}

impl std::fmt::Display for SignalRule {
    /// Canonical form: a group keeps its `( ... )/N` wrapper only when the
    /// threshold is below the condition count.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .groups
            .iter()
            .map(|g| {
                let list = g
                    .conditions
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                if g.threshold < g.conditions.len() {
                    format!("({list})/{}", g.threshold)
                } else {
                    list
                }
            })
            .collect();
        write!(f, "{}", rendered.join("|"))
    }
}

// ---------------------------------------------------------------------------
// Parser internals
// ---------------------------------------------------------------------------

fn parse_group(input: &str) -> Result<ConditionGroup> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty condition group");
    }

    let (list_str, explicit_threshold) = if let Some(rest) = input.strip_prefix('(') {
        let close = rest
            .find(')')
            .ok_or_else(|| anyhow!("unclosed '(' in group '{input}'"))?;
        let list = &rest[..close];
        let tail = rest[close + 1..].trim();
        let threshold = if tail.is_empty() {
            None
        } else if let Some(n) = tail.strip_prefix('/') {
            let n: usize = n
                .trim()
                .parse()
                .with_context(|| format!("invalid group threshold '{n}'"))?;
            Some(n)
        } else {
            bail!("unexpected trailing '{tail}' after group '{list}'");
        };
        (list, threshold)
    } else {
        (input, None)
    };

    let conditions = list_str
        .split(',')
        .map(parse_condition)
        .collect::<Result<Vec<_>>>()?;
    if conditions.is_empty() {
        bail!("group '{input}' has no conditions");
    }

    let threshold = match explicit_threshold {
        Some(0) => bail!("group threshold must be at least 1"),
        Some(n) if n > conditions.len() => bail!(
            "group threshold {n} exceeds condition count {}",
            conditions.len()
        ),
        Some(n) => n,
        None => conditions.len(),
    };

    Ok(ConditionGroup {
        conditions,
        threshold,
    })
}

fn parse_condition(input: &str) -> Result<Condition> {
    let input = input.trim();

    // Two-character operators first so "<=" is not read as "<" then "=".
    const OPS: &[(&str, CmpOp)] = &[
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ];

    for (token, op) in OPS {
        if let Some(pos) = input.find(token) {
            let field_str = &input[..pos];
            let value_str = &input[pos + token.len()..];
            let field = IndicatorField::parse(field_str)?;
            let value: f64 = value_str
                .trim()
                .parse()
                .with_context(|| format!("invalid number '{value_str}' in '{input}'"))?;
            return Ok(Condition {
                field,
                op: *op,
                value,
            });
        }
    }

    bail!("no comparison operator in condition '{input}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource(HashMap<IndicatorField, f64>);

    impl IndicatorSource for MapSource {
        fn indicator(&self, field: &IndicatorField) -> Option<f64> {
            self.0.get(field).copied()
        }
    }

    fn source(entries: &[(IndicatorField, f64)]) -> MapSource {
        MapSource(entries.iter().copied().collect())
    }

    #[test]
    fn parse_single_condition() {
        let rule = SignalRule::parse("RSI:6<20").unwrap();
        assert_eq!(rule.groups.len(), 1);
        assert_eq!(rule.groups[0].threshold, 1);
        assert_eq!(
            rule.groups[0].conditions[0],
            Condition {
                field: IndicatorField::Rsi(6),
                op: CmpOp::Lt,
                value: 20.0
            }
        );
    }

    #[test]
    fn parse_grouped_config_with_threshold() {
        let rule = SignalRule::parse("(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)").unwrap();
        assert_eq!(rule.groups.len(), 2);
        assert_eq!(rule.groups[0].conditions.len(), 4);
        assert_eq!(rule.groups[0].threshold, 3);
        assert_eq!(rule.groups[1].conditions.len(), 1);
        assert_eq!(rule.groups[1].threshold, 1);
    }

    #[test]
    fn evaluate_matches_partial_group() {
        let rule = SignalRule::parse("(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)").unwrap();
        let src = source(&[
            (IndicatorField::Rsi(6), 18.0),
            (IndicatorField::Mfi, 12.0),
            (IndicatorField::D, 18.0),
            (IndicatorField::J, -5.0),
        ]);
        // J<-1 also matches, so all 4 hold; but with J=-0.5 only 3 hold.
        let m = rule.evaluate(&src).unwrap();
        assert_eq!(m.group_index, 0);
        assert!(m.matched >= 3);

        let src = source(&[
            (IndicatorField::Rsi(6), 18.0),
            (IndicatorField::Mfi, 12.0),
            (IndicatorField::D, 18.0),
            (IndicatorField::J, -0.5),
        ]);
        let m = rule.evaluate(&src).unwrap();
        assert_eq!(m.group_index, 0);
        assert_eq!(m.matched, 3);
        assert_eq!(m.threshold, 3);
        assert_eq!(m.total, 4);
    }

    #[test]
    fn evaluate_falls_through_to_second_group() {
        let rule = SignalRule::parse("(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)").unwrap();
        let src = source(&[
            (IndicatorField::Rsi(6), 50.0),
            (IndicatorField::Mfi, 50.0),
            (IndicatorField::D, 50.0),
            (IndicatorField::J, -25.0),
        ]);
        let m = rule.evaluate(&src).unwrap();
        assert_eq!(m.group_index, 1);
        assert_eq!(m.matched, 1);
    }

    #[test]
    fn evaluate_missing_indicator_counts_as_unmatched() {
        let rule = SignalRule::parse("(RSI:6<20,MFI<15)/1").unwrap();
        let src = source(&[(IndicatorField::Mfi, 50.0)]);
        assert!(rule.evaluate(&src).is_none());
    }

    #[test]
    fn default_threshold_is_all() {
        let rule = SignalRule::parse("K>80,D>80").unwrap();
        assert_eq!(rule.groups[0].threshold, 2);
        let src = source(&[(IndicatorField::K, 85.0), (IndicatorField::D, 70.0)]);
        assert!(rule.evaluate(&src).is_none());
    }

    #[test]
    fn negative_thresholds_parse() {
        let rule = SignalRule::parse("J<-20").unwrap();
        assert_eq!(rule.groups[0].conditions[0].value, -20.0);
        assert_eq!(rule.groups[0].conditions[0].op, CmpOp::Lt);
    }

    #[test]
    fn two_char_operators() {
        let rule = SignalRule::parse("RSI:14>=70,MACD!=0").unwrap();
        assert_eq!(rule.groups[0].conditions[0].op, CmpOp::Ge);
        assert_eq!(rule.groups[0].conditions[1].op, CmpOp::Ne);
        assert_eq!(rule.groups[0].conditions[1].field, IndicatorField::Macd);
    }

    #[test]
    fn parse_stringify_parse_roundtrip() {
        for input in [
            "(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)",
            "RSI:14>=70",
            "K>80,D>80|PSY:12>75",
            "(DIF>0,DEA>0,MACD>0)/2",
        ] {
            let rule = SignalRule::parse(input).unwrap();
            let rendered = rule.to_string();
            let reparsed = SignalRule::parse(&rendered).unwrap();
            assert_eq!(rule, reparsed, "roundtrip failed for '{input}'");
        }
    }

    #[test]
    fn malformed_configs_fail() {
        assert!(SignalRule::parse("").is_err());
        assert!(SignalRule::parse("RSI<20").is_err()); // RSI needs a period
        assert!(SignalRule::parse("(RSI:6<20").is_err()); // unclosed paren
        assert!(SignalRule::parse("(RSI:6<20)/5").is_err()); // threshold > count
        assert!(SignalRule::parse("(RSI:6<20)/0").is_err());
        assert!(SignalRule::parse("XYZ<20").is_err());
        assert!(SignalRule::parse("RSI:6?20").is_err());
    }

    #[test]
    fn referenced_fields_dedup() {
        let rule = SignalRule::parse("(RSI:6<20,J<-1)/1|RSI:6>80,K>80").unwrap();
        let fields = rule.referenced_fields();
        assert_eq!(
            fields,
            vec![IndicatorField::Rsi(6), IndicatorField::J, IndicatorField::K]
        );
    }

    #[test]
    fn field_parse_display_roundtrip() {
        for s in ["RSI:6", "PSY:12", "MFI", "K", "D", "J", "MACD", "DIF", "DEA"] {
            assert_eq!(IndicatorField::parse(s).unwrap().to_string(), s);
        }
    }
}
