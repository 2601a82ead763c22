////////////////////////////////////////////////////////////////////////////////
//                                                                            //
//  Copyright (c) 2025 Leonardo Consoni                                       //
//                                                                            //
//  This file is part of Stimwalker.                                          //
//                                                                            //
//  Stimwalker is free software: you can redistribute it and/or modify        //
//  it under the terms of the GNU Lesser General Public License as published  //
//  by the Free Software Foundation, either version 3 of the License, or      //
//  (at your option) any later version.                                       //
//                                                                            //
//  Stimwalker is distributed in the hope that it will be useful,             //
//  but WITHOUT ANY WARRANTY; without even the implied warranty of            //
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the              //
//  GNU Lesser General Public License for more details.                       //
//                                                                            //
//  You should have received a copy of the GNU Lesser General Public License  //
//  along with Stimwalker. If not, see <http://www.gnu.org/licenses/>.        //
//                                                                            //
////////////////////////////////////////////////////////////////////////////////

//! Stimulation rules: start/continue/end predicates bound to a channel set.
//!
//! Rules are built either in code through [`RuleBuilder`], from a declarative
//! JSON [`RuleDescription`], or from one of the [`RuleTemplate`]s offered to
//! protocol clients.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use evalexpr::{build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node, Value};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shared_types::{GaitEvent, Side};

/// Predicate over (elapsed stimulation time if stimulating, left phase, right phase).
pub type Predicate = Arc<dyn Fn(Option<f64>, f64, f64) -> Result<bool> + Send + Sync>;

pub fn predicate<F>(function: F) -> Predicate
where
    F: Fn(Option<f64>, f64, f64) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(function)
}

/// Outcome of one rule evaluation for the rule's channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoChange,
    /// Start stimulating with one amplitude per rule channel.
    StartAt(Vec<f64>),
    Continue,
    /// Drive the rule channels to zero.
    Stop,
}

pub struct StimulationRule {
    name: String,
    channels: Vec<usize>,
    amplitudes: Vec<f64>,
    start: Predicate,
    continue_while: Option<Predicate>,
    end: Option<Predicate>,
    stimulating_since: Option<f64>,
}

impl StimulationRule {
    pub fn builder(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            name: name.into(),
            channels: Vec::new(),
            amplitudes: Vec::new(),
            start: None,
            continue_while: None,
            end: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    pub fn is_stimulating(&self) -> bool {
        self.stimulating_since.is_some()
    }

    pub fn highest_channel(&self) -> Option<usize> {
        self.channels.iter().copied().max()
    }

    /// Forgets an ongoing stimulation, so the next evaluation starts from the start predicate.
    pub fn reset(&mut self) {
        self.stimulating_since = None;
    }

    /// Advances the rule by one scheduler cycle.
    ///
    /// `session_time` is seconds since the session origin. On error the rule state
    /// is left untouched.
    pub fn evaluate(&mut self, session_time: f64, left: f64, right: f64) -> Result<Decision> {
        match self.stimulating_since {
            Some(since) => {
                let elapsed = Some(session_time - since);
                let keep_going = match &self.continue_while {
                    Some(predicate) => predicate(elapsed, left, right)?,
                    None => true,
                };
                let must_end = match &self.end {
                    Some(predicate) => predicate(elapsed, left, right)?,
                    None => false,
                };

                if !keep_going || must_end {
                    self.stimulating_since = None;
                    Ok(Decision::Stop)
                } else {
                    Ok(Decision::Continue)
                }
            }
            None => {
                if (self.start)(None, left, right)? {
                    self.stimulating_since = Some(session_time);
                    Ok(Decision::StartAt(self.amplitudes.clone()))
                } else {
                    Ok(Decision::NoChange)
                }
            }
        }
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            name: self.name.clone(),
            channels: self.channels.clone(),
            amplitudes: self.amplitudes.clone(),
            stimulating: self.is_stimulating(),
        }
    }
}

impl fmt::Debug for StimulationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StimulationRule")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("amplitudes", &self.amplitudes)
            .field("stimulating_since", &self.stimulating_since)
            .finish()
    }
}

impl fmt::Display for StimulationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Listing entry sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub name: String,
    pub channels: Vec<usize>,
    pub amplitudes: Vec<f64>,
    pub stimulating: bool,
}

pub struct RuleBuilder {
    name: String,
    channels: Vec<usize>,
    amplitudes: Vec<f64>,
    start: Option<Predicate>,
    continue_while: Option<Predicate>,
    end: Option<Predicate>,
}

impl RuleBuilder {
    pub fn channels(mut self, channels: impl Into<Vec<usize>>) -> Self {
        self.channels = channels.into();
        self
    }

    pub fn amplitudes(mut self, amplitudes: impl Into<Vec<f64>>) -> Self {
        self.amplitudes = amplitudes.into();
        self
    }

    pub fn start<F>(self, function: F) -> Self
    where
        F: Fn(Option<f64>, f64, f64) -> Result<bool> + Send + Sync + 'static,
    {
        self.start_predicate(predicate(function))
    }

    pub fn continue_while<F>(self, function: F) -> Self
    where
        F: Fn(Option<f64>, f64, f64) -> Result<bool> + Send + Sync + 'static,
    {
        self.continue_predicate(predicate(function))
    }

    pub fn end<F>(self, function: F) -> Self
    where
        F: Fn(Option<f64>, f64, f64) -> Result<bool> + Send + Sync + 'static,
    {
        self.end_predicate(predicate(function))
    }

    pub fn start_predicate(mut self, predicate: Predicate) -> Self {
        self.start = Some(predicate);
        self
    }

    pub fn continue_predicate(mut self, predicate: Predicate) -> Self {
        self.continue_while = Some(predicate);
        self
    }

    pub fn end_predicate(mut self, predicate: Predicate) -> Self {
        self.end = Some(predicate);
        self
    }

    pub fn build(self) -> Result<StimulationRule> {
        let start = self.start.ok_or_else(|| {
            Error::configuration(format!("rule '{}' has no start predicate", self.name))
        })?;
        if self.continue_while.is_none() && self.end.is_none() {
            return Err(Error::configuration(format!(
                "rule '{}' needs a continue or an end predicate",
                self.name
            )));
        }
        if self.channels.is_empty() {
            return Err(Error::configuration(format!("rule '{}' targets no channel", self.name)));
        }
        if self.channels.len() != self.amplitudes.len() {
            return Err(Error::configuration(format!(
                "rule '{}' has {} channels but {} amplitudes",
                self.name,
                self.channels.len(),
                self.amplitudes.len()
            )));
        }
        if self.amplitudes.iter().any(|amplitude| !amplitude.is_finite() || *amplitude < 0.0) {
            return Err(Error::configuration(format!(
                "rule '{}' has a negative or non-finite amplitude",
                self.name
            )));
        }

        Ok(StimulationRule {
            name: self.name,
            channels: self.channels,
            amplitudes: self.amplitudes,
            start,
            continue_while: self.continue_while,
            end: self.end,
            stimulating_since: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">=", alias = "greater_or_equal", alias = "from")]
    GreaterOrEqual,
    #[serde(rename = ">", alias = "greater_than", alias = "after")]
    GreaterThan,
    #[serde(rename = "<=", alias = "less_or_equal", alias = "to")]
    LessOrEqual,
    #[serde(rename = "<", alias = "less_than", alias = "before")]
    LessThan,
}

impl Comparison {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::GreaterThan => value > threshold,
            Comparison::LessOrEqual => value <= threshold,
            Comparison::LessThan => value < threshold,
        }
    }
}

/// One declarative condition.
///
/// Exactly one of `gait_event`, `gait_percentage`, `duration` or `expression`
/// selects the kind; phase conditions also need `side` and `comparison`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gait_event: Option<GaitEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gait_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

impl ConditionDescription {
    pub fn compile(&self) -> Result<Predicate> {
        let kinds = [
            self.gait_event.is_some(),
            self.gait_percentage.is_some(),
            self.duration.is_some(),
            self.expression.is_some(),
        ];
        match kinds.iter().filter(|present| **present).count() {
            1 => {}
            0 => {
                return Err(Error::configuration(
                    "condition needs one of gait_event, gait_percentage, duration or expression",
                ))
            }
            _ => {
                return Err(Error::configuration(
                    "condition mixes gait_event, gait_percentage, duration and expression",
                ))
            }
        }

        if let Some(expression) = &self.expression {
            return compile_expression(expression);
        }

        if let Some(duration) = self.duration {
            let comparison = self.comparison.unwrap_or(Comparison::LessThan);
            return Ok(predicate(move |elapsed, _, _| {
                Ok(elapsed.is_some_and(|elapsed| comparison.apply(elapsed, duration)))
            }));
        }

        let threshold = match (self.gait_event, self.gait_percentage) {
            (Some(event), _) => event.stride_percentage(),
            (None, Some(percentage)) => percentage,
            (None, None) => return Err(Error::configuration("gait condition has no threshold")),
        };
        let comparison = self
            .comparison
            .ok_or_else(|| Error::configuration("gait condition needs a comparison"))?;
        match self.side {
            Some(Side::Left) => Ok(predicate(move |_, left, _| Ok(comparison.apply(left, threshold)))),
            Some(Side::Right) => Ok(predicate(move |_, _, right| Ok(comparison.apply(right, threshold)))),
            Some(Side::Both) | None => Err(Error::configuration(
                "gait condition side must be either 'left' or 'right'",
            )),
        }
    }
}

fn compile_expression(expression: &str) -> Result<Predicate> {
    let tree: Node<DefaultNumericTypes> = build_operator_tree(expression)
        .map_err(|error| Error::configuration(format!("invalid expression '{expression}': {error}")))?;
    let tree = Arc::new(tree);

    Ok(predicate(move |elapsed, left, right| {
        let mut context = HashMapContext::<DefaultNumericTypes>::new();
        let variables = [
            ("elapsed", Value::Float(elapsed.unwrap_or(0.0))),
            ("stimulating", Value::Boolean(elapsed.is_some())),
            ("left", Value::Float(left)),
            ("right", Value::Float(right)),
        ];
        for (name, value) in variables {
            context
                .set_value(name.to_string(), value)
                .map_err(|error| Error::malformed(format!("expression context: {error}")))?;
        }
        tree.eval_boolean_with_context(&context)
            .map_err(|error| Error::malformed(format!("expression evaluation failed: {error}")))
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseDescription {
    pub channels: Vec<usize>,
    pub amplitudes: Vec<f64>,
}

/// Data-driven rule, as stored in a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub pulse: PulseDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_stimulating_rule: Option<ConditionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_stimulating_rule: Option<ConditionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_stimulating_rule: Option<ConditionDescription>,
}

impl RuleDescription {
    pub fn build(&self) -> Result<StimulationRule> {
        let mut builder = StimulationRule::builder(&self.name)
            .channels(self.pulse.channels.clone())
            .amplitudes(self.pulse.amplitudes.clone());
        if let Some(condition) = &self.start_stimulating_rule {
            builder = builder.start_predicate(condition.compile()?);
        }
        if let Some(condition) = &self.continue_stimulating_rule {
            builder = builder.continue_predicate(condition.compile()?);
        }
        if let Some(condition) = &self.end_stimulating_rule {
            builder = builder.end_predicate(condition.compile()?);
        }
        builder.build()
    }
}

/// Reads a JSON array of rule descriptions.
pub fn load_descriptions(path: &Path) -> Result<Vec<RuleDescription>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub const SWING_PHASE_TEMPLATE: &str = "stimulate_in_swing_phase";

/// Electrode block driven by each leg in the swing-phase template.
fn leg_channels(side: Side) -> Vec<usize> {
    match side {
        Side::Left => (0..4).collect(),
        _ => (4..8).collect(),
    }
}

/// Entry of the catalogue protocol clients pick rules from.
#[derive(Debug, Clone)]
pub enum RuleTemplate {
    SwingPhase { amplitude: f64 },
    Declarative(RuleDescription),
}

impl RuleTemplate {
    pub fn name(&self) -> &str {
        match self {
            RuleTemplate::SwingPhase { .. } => SWING_PHASE_TEMPLATE,
            RuleTemplate::Declarative(description) => &description.name,
        }
    }

    pub fn description(&self) -> String {
        match self {
            RuleTemplate::SwingPhase { amplitude } => format!(
                "Stimulate while the leg is in swing phase (toe off onwards) at {amplitude} mA. \
                 Side: 0 left (channels 0-3), 1 right (channels 4-7), 2 both."
            ),
            RuleTemplate::Declarative(description) => description
                .description
                .clone()
                .unwrap_or_else(|| format!("Rule on channels {:?}", description.pulse.channels)),
        }
    }

    /// Builds the rules for `side`. Declarative templates carry their own sides.
    pub fn instantiate(&self, side: Side) -> Result<Vec<StimulationRule>> {
        match self {
            RuleTemplate::SwingPhase { amplitude } => side
                .legs()
                .iter()
                .map(|leg| swing_phase_rule(*leg, *amplitude))
                .collect(),
            RuleTemplate::Declarative(description) => Ok(vec![description.build()?]),
        }
    }

    pub fn info(&self, index: usize) -> TemplateInfo {
        TemplateInfo {
            index,
            name: self.name().to_string(),
            description: self.description(),
        }
    }
}

fn swing_phase_rule(leg: Side, amplitude: f64) -> Result<StimulationRule> {
    let in_swing = ConditionDescription {
        gait_event: Some(GaitEvent::ToeOff),
        side: Some(leg),
        comparison: Some(Comparison::GreaterOrEqual),
        ..Default::default()
    }
    .compile()?;

    let channels = leg_channels(leg);
    StimulationRule::builder(format!("{SWING_PHASE_TEMPLATE} on {leg}"))
        .amplitudes(vec![amplitude; channels.len()])
        .channels(channels)
        .start_predicate(Arc::clone(&in_swing))
        .continue_predicate(in_swing)
        .build()
}

/// Built-in templates followed by the declarative ones from the rules file.
pub fn template_catalogue(amplitude: f64, descriptions: Vec<RuleDescription>) -> Vec<RuleTemplate> {
    std::iter::once(RuleTemplate::SwingPhase { amplitude })
        .chain(descriptions.into_iter().map(RuleTemplate::Declarative))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub index: usize,
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left_swing_rule(amplitude: f64) -> StimulationRule {
        StimulationRule::builder("left swing")
            .channels(vec![0, 1, 2, 3])
            .amplitudes(vec![amplitude; 4])
            .start(|_, left, _| Ok(left >= 0.6))
            .continue_while(|_, left, _| Ok(left >= 0.6))
            .build()
            .unwrap()
    }

    #[test]
    fn test_swing_phase_scenario() {
        let mut rule = left_swing_rule(30.0);
        assert_eq!(rule.evaluate(0.0, 0.4, 0.0).unwrap(), Decision::NoChange);
        assert_eq!(rule.evaluate(0.1, 0.7, 0.0).unwrap(), Decision::StartAt(vec![30.0; 4]));
        assert!(rule.is_stimulating());
        assert_eq!(rule.evaluate(0.2, 0.5, 0.0).unwrap(), Decision::Stop);
        assert!(!rule.is_stimulating());
    }

    #[test]
    fn test_reset_returns_to_start_predicate() {
        let mut rule = left_swing_rule(10.0);
        rule.evaluate(0.0, 0.7, 0.0).unwrap();
        rule.reset();
        assert!(!rule.is_stimulating());
        assert_eq!(rule.evaluate(0.1, 0.8, 0.0).unwrap(), Decision::StartAt(vec![10.0; 4]));
    }

    #[test]
    fn test_continue_while_predicate_holds() {
        let mut rule = left_swing_rule(10.0);
        rule.evaluate(0.0, 0.7, 0.0).unwrap();
        assert_eq!(rule.evaluate(0.1, 0.8, 0.0).unwrap(), Decision::Continue);
    }

    #[test]
    fn test_end_only_rule_runs_until_end_fires() {
        let mut rule = StimulationRule::builder("burst")
            .channels(vec![2])
            .amplitudes(vec![15.0])
            .start(|_, _, right| Ok(right > 0.1))
            .end(|elapsed, _, _| Ok(elapsed.is_some_and(|elapsed| elapsed >= 0.3)))
            .build()
            .unwrap();

        assert_eq!(rule.evaluate(1.0, 0.0, 0.5).unwrap(), Decision::StartAt(vec![15.0]));
        assert_eq!(rule.evaluate(1.2, 0.0, 0.0).unwrap(), Decision::Continue);
        assert_eq!(rule.evaluate(1.3, 0.0, 0.0).unwrap(), Decision::Stop);
    }

    #[test]
    fn test_failing_predicate_keeps_state() {
        let mut rule = StimulationRule::builder("broken")
            .channels(vec![0])
            .amplitudes(vec![1.0])
            .start(|_, _, _| Err(Error::malformed("sensor glitch")))
            .end(|_, _, _| Ok(true))
            .build()
            .unwrap();
        assert!(rule.evaluate(0.0, 0.5, 0.5).is_err());
        assert!(!rule.is_stimulating());
    }

    #[test]
    fn test_construction_errors() {
        let missing_stop = StimulationRule::builder("no stop")
            .channels(vec![0])
            .amplitudes(vec![1.0])
            .start(|_, _, _| Ok(true))
            .build();
        assert!(matches!(missing_stop, Err(Error::Configuration(_))));

        let missing_start = StimulationRule::builder("no start")
            .channels(vec![0])
            .amplitudes(vec![1.0])
            .end(|_, _, _| Ok(true))
            .build();
        assert!(matches!(missing_start, Err(Error::Configuration(_))));

        let mismatched = StimulationRule::builder("mismatch")
            .channels(vec![0, 1])
            .amplitudes(vec![1.0])
            .start(|_, _, _| Ok(true))
            .end(|_, _, _| Ok(true))
            .build();
        assert!(matches!(mismatched, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_declarative_rule_from_json() {
        let text = r#"{
            "name": "right toe off burst",
            "pulse": {"channels": [4, 5], "amplitudes": [20, 25]},
            "start_stimulating_rule": {"gait_event": "toe_off", "side": "right", "comparison": "from"},
            "end_stimulating_rule": {"duration": 0.2, "comparison": ">="}
        }"#;
        let description: RuleDescription = serde_json::from_str(text).unwrap();
        let mut rule = description.build().unwrap();

        assert_eq!(rule.evaluate(0.0, 0.9, 0.5).unwrap(), Decision::NoChange);
        assert_eq!(rule.evaluate(0.1, 0.9, 0.6).unwrap(), Decision::StartAt(vec![20.0, 25.0]));
        assert_eq!(rule.evaluate(0.2, 0.9, 0.7).unwrap(), Decision::Continue);
        assert_eq!(rule.evaluate(0.35, 0.9, 0.7).unwrap(), Decision::Stop);
    }

    #[test]
    fn test_declarative_without_stop_condition_is_rejected() {
        let text = r#"{
            "name": "forever",
            "pulse": {"channels": [0], "amplitudes": [5]},
            "start_stimulating_rule": {"gait_percentage": 0.2, "side": "left", "comparison": ">"}
        }"#;
        let description: RuleDescription = serde_json::from_str(text).unwrap();
        assert!(matches!(description.build(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_phase_condition_requires_side() {
        let condition = ConditionDescription {
            gait_percentage: Some(0.3),
            comparison: Some(Comparison::LessThan),
            ..Default::default()
        };
        assert!(matches!(condition.compile(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_expression_condition() {
        let condition = ConditionDescription {
            expression: Some("left > 0.5 && !stimulating".to_string()),
            ..Default::default()
        };
        let predicate = condition.compile().unwrap();
        assert!(predicate(None, 0.6, 0.0).unwrap());
        assert!(!predicate(Some(0.1), 0.6, 0.0).unwrap());

        let invalid = ConditionDescription {
            expression: Some("left >".to_string()),
            ..Default::default()
        };
        assert!(invalid.compile().is_err());
    }

    #[test]
    fn test_swing_template_instantiation() {
        let template = RuleTemplate::SwingPhase { amplitude: 40.0 };
        let rules = template.instantiate(Side::Both).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].channels(), &[0, 1, 2, 3]);
        assert_eq!(rules[1].channels(), &[4, 5, 6, 7]);
        assert_eq!(rules[1].amplitudes(), &[40.0; 4]);

        let right = template.instantiate(Side::Right).unwrap();
        assert_eq!(right.len(), 1);
        assert!(right[0].name().ends_with("right"));
    }

    #[test]
    fn test_catalogue_lists_builtin_first() {
        let description = RuleDescription {
            name: "custom".to_string(),
            description: None,
            pulse: PulseDescription {
                channels: vec![0],
                amplitudes: vec![1.0],
            },
            start_stimulating_rule: Some(ConditionDescription {
                expression: Some("true".to_string()),
                ..Default::default()
            }),
            continue_stimulating_rule: None,
            end_stimulating_rule: Some(ConditionDescription {
                duration: Some(1.0),
                comparison: Some(Comparison::GreaterOrEqual),
                ..Default::default()
            }),
        };
        let catalogue = template_catalogue(50.0, vec![description]);
        assert_eq!(catalogue[0].name(), SWING_PHASE_TEMPLATE);
        assert_eq!(catalogue[1].info(1).name, "custom");
        assert_eq!(catalogue[1].instantiate(Side::Left).unwrap().len(), 1);
    }
}
