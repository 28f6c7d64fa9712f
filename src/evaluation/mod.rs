mod classification;
mod detection;
mod precision;

use std::{fmt, str::FromStr};

use comms::Scalar;

pub use classification::classify;
pub use detection::{DetectionStats, detect};
pub use precision::{ApVersion, PrecisionRecall, average_precision};

use crate::error::SolverErr;

/// The algorithm turning a test net's outputs into scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalType {
    /// Mean of every output element over the passes.
    Classification,
    /// Mean average precision of rows shaped `[item_id, label, score, tp, fp]`.
    Detection,
}

impl FromStr for EvalType {
    type Err = SolverErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(EvalType::Classification),
            "detection" => Ok(EvalType::Detection),
            other => Err(SolverErr::UnknownEvalType(other.to_string())),
        }
    }
}

impl fmt::Display for EvalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalType::Classification => f.write_str("classification"),
            EvalType::Detection => f.write_str("detection"),
        }
    }
}

/// How a single test net is evaluated, fixed at initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRunSpec {
    pub net_id: usize,
    pub iterations: usize,
    pub compute_loss: bool,
    pub eval_type: EvalType,
    pub ap_version: ApVersion,
}

/// The mean score of a single output element, or an output's mAP.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScore<T> {
    pub name: String,
    pub value: T,
    pub loss_weight: T,
}

impl<T: Scalar> fmt::Display for OutputScore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)?;
        if self.loss_weight != T::default() {
            let weighted = self.value * self.loss_weight;
            write!(f, " (* {} = {} loss)", self.loss_weight, weighted)?;
        }
        Ok(())
    }
}

/// The result of a full test run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport<T> {
    pub net_id: usize,
    /// The mean loss, when the run computed it.
    pub loss: Option<T>,
    pub scores: Vec<OutputScore<T>>,
}

/// How a test run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome<T> {
    Completed(TestReport<T>),
    /// A stop request arrived before every pass ran, no scores were computed.
    Interrupted,
}

impl<T> TestOutcome<T> {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TestOutcome::Interrupted)
    }

    pub fn report(&self) -> Option<&TestReport<T>> {
        match self {
            TestOutcome::Completed(report) => Some(report),
            TestOutcome::Interrupted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_types_parse() {
        assert_eq!("detection".parse::<EvalType>().unwrap(), EvalType::Detection);
        assert!(matches!(
            "segmentation".parse::<EvalType>(),
            Err(SolverErr::UnknownEvalType(name)) if name == "segmentation"
        ));
    }

    #[test]
    fn scores_display_their_weighted_loss() {
        let plain = OutputScore {
            name: "accuracy".to_string(),
            value: 0.5_f32,
            loss_weight: 0.0,
        };
        assert_eq!(plain.to_string(), "accuracy = 0.5");

        let weighted = OutputScore {
            name: "loss".to_string(),
            value: 0.5_f32,
            loss_weight: 2.0,
        };
        assert_eq!(weighted.to_string(), "loss = 0.5 (* 2 = 1 loss)");
    }
}
