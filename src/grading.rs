//! Automatic scoring of assignment attempts.
//!
//! Objective questions are scored on submit. Essays and coding answers score
//! nothing here and are flagged for a manager to grade by hand.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
    Coding,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::TrueFalse => "true_false",
            QuestionKind::ShortAnswer => "short_answer",
            QuestionKind::Essay => "essay",
            QuestionKind::Coding => "coding",
        }
    }

    pub fn needs_manual_review(self) -> bool {
        matches!(self, QuestionKind::Essay | QuestionKind::Coding)
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "multiple_choice" => QuestionKind::MultipleChoice,
            "true_false" => QuestionKind::TrueFalse,
            "short_answer" => QuestionKind::ShortAnswer,
            "essay" => QuestionKind::Essay,
            "coding" => QuestionKind::Coding,
            other => anyhow::bail!("unknown question kind `{other}`"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GradableQuestion {
    pub id: Uuid,
    pub kind: QuestionKind,
    pub correct_answer: Option<Value>,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedAnswer {
    pub answer: Option<Value>,
    pub points_awarded: i32,
    pub max_points: i32,
    pub is_correct: bool,
    pub needs_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeReport {
    pub score: i32,
    pub max_score: i32,
    pub percentage: f64,
    pub is_passing: bool,
    pub graded_answers: HashMap<Uuid, GradedAnswer>,
}

fn is_blank(answer: &Value) -> bool {
    match answer {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn is_correct(kind: QuestionKind, answer: &Value, correct: &Value) -> bool {
    match kind {
        QuestionKind::MultipleChoice => answer == correct,
        QuestionKind::TrueFalse => match (as_bool(answer), as_bool(correct)) {
            (Some(a), Some(c)) => a == c,
            _ => false,
        },
        QuestionKind::ShortAnswer => {
            let Some(given) = answer.as_str().map(normalize) else {
                return false;
            };
            match correct {
                Value::String(accepted) => normalize(accepted) == given,
                Value::Array(accepted) => accepted
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|a| normalize(a) == given),
                _ => false,
            }
        }
        QuestionKind::Essay | QuestionKind::Coding => false,
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn grade(
    questions: &[GradableQuestion],
    answers: &HashMap<Uuid, Value>,
    passing_score: i32,
) -> GradeReport {
    let mut graded_answers = HashMap::with_capacity(questions.len());
    let mut score = 0;
    let mut max_score = 0;

    for question in questions {
        max_score += question.points;
        let answer = answers.get(&question.id).filter(|a| !is_blank(a)).cloned();

        let correct = match (&answer, &question.correct_answer) {
            (Some(answer), Some(correct)) => is_correct(question.kind, answer, correct),
            _ => false,
        };
        let points_awarded = if correct { question.points } else { 0 };
        score += points_awarded;

        graded_answers.insert(
            question.id,
            GradedAnswer {
                needs_review: answer.is_some() && question.kind.needs_manual_review(),
                answer,
                points_awarded,
                max_points: question.points,
                is_correct: correct,
            },
        );
    }

    let percentage = if max_score > 0 {
        round2(f64::from(score) / f64::from(max_score) * 100.0)
    } else {
        0.0
    };

    GradeReport {
        score,
        max_score,
        percentage,
        is_passing: percentage >= f64::from(passing_score),
        graded_answers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(kind: QuestionKind, correct: Value, points: i32) -> GradableQuestion {
        GradableQuestion {
            id: Uuid::new_v4(),
            kind,
            correct_answer: Some(correct),
            points,
        }
    }

    #[test]
    fn scores_objective_questions() {
        let mc = question(QuestionKind::MultipleChoice, json!("B"), 2);
        let tf = question(QuestionKind::TrueFalse, json!(true), 1);
        let short = question(QuestionKind::ShortAnswer, json!(["Rust", "rustlang"]), 3);
        let answers = HashMap::from([
            (mc.id, json!("B")),
            (tf.id, json!("true")),
            (short.id, json!("  RUSTLANG ")),
        ]);

        let report = grade(&[mc.clone(), tf, short], &answers, 60);
        assert_eq!(report.score, 6);
        assert_eq!(report.max_score, 6);
        assert_eq!(report.percentage, 100.0);
        assert!(report.is_passing);
        assert!(report.graded_answers[&mc.id].is_correct);
    }

    #[test]
    fn missing_and_blank_answers_score_zero() {
        let a = question(QuestionKind::MultipleChoice, json!("A"), 1);
        let b = question(QuestionKind::ShortAnswer, json!("tokio"), 1);
        let c = question(QuestionKind::TrueFalse, json!(false), 1);
        let answers = HashMap::from([(a.id, json!("A")), (b.id, json!("   "))]);

        let report = grade(&[a, b.clone(), c], &answers, 50);
        assert_eq!(report.score, 1);
        assert_eq!(report.percentage, 33.33);
        assert!(!report.is_passing);
        assert_eq!(report.graded_answers[&b.id].answer, None);
    }

    #[test]
    fn essays_wait_for_review() {
        let essay = GradableQuestion {
            id: Uuid::new_v4(),
            kind: QuestionKind::Essay,
            correct_answer: None,
            points: 10,
        };
        let mc = question(QuestionKind::MultipleChoice, json!(2), 10);
        let answers = HashMap::from([(essay.id, json!("Ownership means...")), (mc.id, json!(2))]);

        let report = grade(&[essay.clone(), mc], &answers, 50);
        assert_eq!(report.score, 10);
        assert_eq!(report.percentage, 50.0);
        assert!(report.is_passing);
        let graded = &report.graded_answers[&essay.id];
        assert!(graded.needs_review);
        assert_eq!(graded.points_awarded, 0);
    }

    #[test]
    fn empty_assignment_is_zero_percent() {
        let report = grade(&[], &HashMap::new(), 0);
        assert_eq!(report.max_score, 0);
        assert_eq!(report.percentage, 0.0);
        assert!(report.is_passing);
    }

    #[test]
    fn kinds_parse() {
        assert_eq!(
            "short_answer".parse::<QuestionKind>().unwrap(),
            QuestionKind::ShortAnswer
        );
        assert!("matching".parse::<QuestionKind>().is_err());
    }
}
