use std::{fmt, str::FromStr};

use crate::error::{Result, SolverErr};

const EPS: f64 = 1e-6;

/// The policy reducing a precision/recall curve to a single number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApVersion {
    /// Mean of the max precision at recall 0, 0.1, .., 1.
    ElevenPoint,
    /// Area under the curve made monotonically decreasing.
    MaxIntegral,
    /// Area under the raw curve.
    #[default]
    Integral,
}

impl FromStr for ApVersion {
    type Err = SolverErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "11point" => Ok(ApVersion::ElevenPoint),
            "MaxIntegral" => Ok(ApVersion::MaxIntegral),
            "Integral" => Ok(ApVersion::Integral),
            other => Err(SolverErr::UnknownApVersion(other.to_string())),
        }
    }
}

impl fmt::Display for ApVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApVersion::ElevenPoint => f.write_str("11point"),
            ApVersion::MaxIntegral => f.write_str("MaxIntegral"),
            ApVersion::Integral => f.write_str("Integral"),
        }
    }
}

/// Cumulative precision and recall after each detection, best score first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecisionRecall {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
}

/// Computes the average precision of a single label.
///
/// # Arguments
/// * `tp` - `(score, is_true_positive)` for every detection of the label.
/// * `fp` - `(score, is_false_positive)`, the complement of `tp`.
/// * `num_pos` - The amount of ground truth positives of the label.
/// * `version` - How to integrate the curve.
///
/// # Returns
/// The average precision with the curve it was computed from, or a consistency
/// error if `tp` and `fp` aren't complementary.
pub fn average_precision(
    tp: &[(f64, u32)],
    fp: &[(f64, u32)],
    num_pos: usize,
    version: ApVersion,
) -> Result<(f64, PrecisionRecall)> {
    if tp.len() != fp.len() {
        return Err(SolverErr::Consistency(format!(
            "{} true positive entries against {} false positive entries",
            tp.len(),
            fp.len()
        )));
    }

    for (i, (&(tp_score, tp_flag), &(fp_score, fp_flag))) in tp.iter().zip(fp).enumerate() {
        if (tp_score - fp_score).abs() > EPS || tp_flag + fp_flag != 1 {
            return Err(SolverErr::Consistency(format!(
                "detection {i} is not complementary: tp ({tp_score}, {tp_flag}), fp ({fp_score}, {fp_flag})"
            )));
        }
    }

    if tp.is_empty() || num_pos == 0 {
        return Ok((0.0, PrecisionRecall::default()));
    }

    let mut order: Vec<usize> = (0..tp.len()).collect();
    order.sort_by(|&a, &b| tp[b].0.total_cmp(&tp[a].0));

    let mut curve = PrecisionRecall {
        precision: Vec::with_capacity(tp.len()),
        recall: Vec::with_capacity(tp.len()),
    };

    let (mut tp_cum, mut fp_cum) = (0u32, 0u32);
    for i in order {
        tp_cum += tp[i].1;
        fp_cum += fp[i].1;

        if tp_cum as usize > num_pos {
            return Err(SolverErr::Consistency(format!(
                "{tp_cum} true positives exceed the {num_pos} ground truth positives"
            )));
        }

        curve
            .precision
            .push(tp_cum as f64 / (tp_cum + fp_cum) as f64);
        curve.recall.push(tp_cum as f64 / num_pos as f64);
    }

    let ap = match version {
        ApVersion::ElevenPoint => eleven_point(&curve),
        ApVersion::MaxIntegral => max_integral(&curve),
        ApVersion::Integral => integral(&curve),
    };

    Ok((ap, curve))
}

fn eleven_point(curve: &PrecisionRecall) -> f64 {
    (0..=10)
        .map(|t| {
            let threshold = t as f64 / 10.0;
            curve
                .recall
                .iter()
                .zip(&curve.precision)
                .filter(|&(&rec, _)| rec >= threshold)
                .map(|(_, &prec)| prec)
                .fold(0.0, f64::max)
        })
        .sum::<f64>()
        / 11.0
}

fn max_integral(curve: &PrecisionRecall) -> f64 {
    let PrecisionRecall { precision, recall } = curve;
    let last = precision.len() - 1;

    let mut ap = 0.0;
    let mut cur_rec = recall[last];
    let mut cur_prec = precision[last];

    for i in (0..last).rev() {
        cur_prec = cur_prec.max(precision[i]);
        let delta = (cur_rec - recall[i]).abs();
        if delta > EPS {
            ap += cur_prec * delta;
        }
        cur_rec = recall[i];
    }

    ap + cur_rec * cur_prec
}

fn integral(curve: &PrecisionRecall) -> f64 {
    let mut ap = 0.0;
    let mut prev_rec = 0.0;

    for (&prec, &rec) in curve.precision.iter().zip(&curve.recall) {
        let delta = (rec - prev_rec).abs();
        if delta > EPS {
            ap += prec * delta;
        }
        prev_rec = rec;
    }

    ap
}

#[cfg(test)]
mod tests {
    use super::*;

    const TP: [(f64, u32); 3] = [(0.9, 1), (0.8, 0), (0.5, 1)];
    const FP: [(f64, u32); 3] = [(0.9, 0), (0.8, 1), (0.5, 0)];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn cumulative_precision_and_recall() {
        let (_, curve) = average_precision(&TP, &FP, 10, ApVersion::Integral).unwrap();

        let want_prec = [1.0, 0.5, 2.0 / 3.0];
        let want_rec = [0.1, 0.1, 0.2];
        assert!(curve.precision.iter().zip(want_prec).all(|(&a, b)| close(a, b)));
        assert!(curve.recall.iter().zip(want_rec).all(|(&a, b)| close(a, b)));
    }

    #[test]
    fn detections_are_ranked_by_score() {
        let tp = [(0.5, 1), (0.9, 1), (0.8, 0)];
        let fp = [(0.5, 0), (0.9, 0), (0.8, 1)];
        let (ap, curve) = average_precision(&tp, &fp, 10, ApVersion::Integral).unwrap();
        let (want, _) = average_precision(&TP, &FP, 10, ApVersion::Integral).unwrap();

        assert!(close(curve.precision[0], 1.0));
        assert!(close(ap, want));
    }

    #[test]
    fn every_policy_integrates_the_same_curve() {
        let (integral, _) = average_precision(&TP, &FP, 10, ApVersion::Integral).unwrap();
        let (max_integral, _) = average_precision(&TP, &FP, 10, ApVersion::MaxIntegral).unwrap();
        let (eleven, _) = average_precision(&TP, &FP, 10, ApVersion::ElevenPoint).unwrap();

        let want = 0.1 + 0.1 * 2.0 / 3.0;
        assert!(close(integral, want), "{integral}");
        assert!(close(max_integral, want), "{max_integral}");
        assert!(close(eleven, (1.0 + 1.0 + 2.0 / 3.0) / 11.0), "{eleven}");
    }

    #[test]
    fn max_integral_flattens_precision_dips() {
        let tp = [(0.9, 0), (0.8, 1), (0.7, 1)];
        let fp = [(0.9, 1), (0.8, 0), (0.7, 0)];

        let (integral, _) = average_precision(&tp, &fp, 2, ApVersion::Integral).unwrap();
        let (max_integral, _) = average_precision(&tp, &fp, 2, ApVersion::MaxIntegral).unwrap();

        assert!(close(integral, 7.0 / 12.0), "{integral}");
        assert!(close(max_integral, 2.0 / 3.0), "{max_integral}");
    }

    #[test]
    fn no_detections_or_no_positives_is_zero() {
        let (ap, curve) = average_precision(&[], &[], 4, ApVersion::MaxIntegral).unwrap();
        assert_eq!(ap, 0.0);
        assert!(curve.precision.is_empty());

        let (ap, _) = average_precision(&TP, &FP, 0, ApVersion::ElevenPoint).unwrap();
        assert_eq!(ap, 0.0);
    }

    #[test]
    fn non_complementary_lists_are_fatal() {
        let fp = [(0.9, 1), (0.8, 1), (0.5, 0)];
        assert!(matches!(
            average_precision(&TP, &fp, 10, ApVersion::Integral),
            Err(SolverErr::Consistency(_))
        ));

        assert!(matches!(
            average_precision(&TP, &FP[..2], 10, ApVersion::Integral),
            Err(SolverErr::Consistency(_))
        ));
    }

    #[test]
    fn ap_versions_parse() {
        assert_eq!("11point".parse::<ApVersion>().unwrap(), ApVersion::ElevenPoint);
        assert_eq!("MaxIntegral".parse::<ApVersion>().unwrap(), ApVersion::MaxIntegral);
        assert!("integral".parse::<ApVersion>().is_err());
    }
}
