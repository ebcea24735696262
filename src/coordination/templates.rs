//! Per-step prompt templates with named placeholders.
//!
//! A template refers to the raw chain input as `{input}` and to the output of
//! an earlier step by that step's name, e.g. `{answer}`. Literal braces are
//! written `{{` and `}}`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// Placeholder name bound to the raw chain input
pub const INPUT_PLACEHOLDER: &str = "input";

/// Values available to a step: the raw input plus every earlier step's output, by name
pub type PriorOutputs = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub template: String,
}

impl StepTemplate {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Ordered template list; index 0 holds step 1
#[derive(Debug, Clone)]
pub struct StepTemplates {
    steps: Vec<StepTemplate>,
}

impl StepTemplates {
    /// Validate and wrap a template list
    ///
    /// Every placeholder of step `i` must name the input or one of steps `1..i`.
    pub fn new(steps: Vec<StepTemplate>) -> Result<Self, TemplateError> {
        if steps.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut known: Vec<&str> = vec![INPUT_PLACEHOLDER];
        for (idx, step) in steps.iter().enumerate() {
            let step_number = idx as u32 + 1;
            for segment in parse(&step.template, step_number)? {
                if let Segment::Placeholder(name) = segment
                    && !known.contains(&name)
                {
                    return Err(TemplateError::UnknownPlaceholder {
                        step_number,
                        placeholder: name.to_string(),
                    });
                }
            }
            if step.name.trim().is_empty() || known.contains(&step.name.as_str()) {
                return Err(TemplateError::DuplicateName(step.name.clone()));
            }
            known.push(&step.name);
        }

        Ok(Self { steps })
    }

    /// Built-in three-step chain: answer, rate the answer, accept or reject
    pub fn reference() -> Self {
        Self {
            steps: vec![
                StepTemplate::new(
                    "answer",
                    "Answer the following question. Reply with the answer only.\n\nQuestion: {input}",
                ),
                StepTemplate::new(
                    "confidence",
                    "Here is a proposed answer: {answer}\n\nRate how likely it is to be correct on a \
                     scale from 1 to 10. Reply with the number only.",
                ),
                StepTemplate::new(
                    "verdict",
                    "Proposed answer: {answer}\nConfidence: {confidence}\n\nReply 1 if the answer \
                     should be accepted, otherwise reply 0.",
                ),
            ],
        }
    }

    /// Load a JSON array of `{"name": ..., "template": ...}` objects
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file {}", path.display()))?;
        let steps: Vec<StepTemplate> =
            serde_json::from_str(&contents).context("Failed to parse template file")?;
        Self::new(steps).context("Invalid step templates")
    }

    /// Number of steps in every chain
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Template for a 1-based step number
    pub fn get(&self, step_number: u32) -> Option<&StepTemplate> {
        (step_number as usize)
            .checked_sub(1)
            .and_then(|idx| self.steps.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepTemplate> {
        self.steps.iter()
    }

    /// Substitute placeholders of step `step_number` from `prior`
    pub fn render(&self, step_number: u32, prior: &PriorOutputs) -> Result<String, TemplateError> {
        let Some(step) = self.get(step_number) else {
            return Err(TemplateError::UnknownPlaceholder {
                step_number,
                placeholder: format!("<step {step_number} is not configured>"),
            });
        };

        let mut prompt = String::with_capacity(step.template.len());
        for segment in parse(&step.template, step_number)? {
            match segment {
                Segment::Literal(text) => prompt.push_str(text),
                Segment::Placeholder(name) => {
                    let value = prior.get(name).ok_or_else(|| {
                        TemplateError::UnknownPlaceholder {
                            step_number,
                            placeholder: name.to_string(),
                        }
                    })?;
                    prompt.push_str(value);
                }
            }
        }
        Ok(prompt)
    }
}

fn parse(template: &str, step_number: u32) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        let Some(pos) = rest.find(['{', '}']) else {
            segments.push(Segment::Literal(rest));
            break;
        };

        if pos > 0 {
            segments.push(Segment::Literal(&rest[..pos]));
        }
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            segments.push(Segment::Literal("{"));
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            segments.push(Segment::Literal("}"));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            segments.push(Segment::Literal("}"));
            rest = &tail[1..];
        } else {
            let Some(end) = tail.find('}') else {
                return Err(TemplateError::Unterminated { step_number });
            };
            segments.push(Segment::Placeholder(tail[1..end].trim()));
            rest = &tail[end + 1..];
        }
    }

    Ok(segments)
}
