use std::{collections::BTreeMap, ops::ControlFlow};

use comms::Scalar;
use log::{debug, warn};

use super::{ApVersion, OutputScore, TestOutcome, TestReport, TestRunSpec, average_precision};
use crate::{
    error::{Result, SolverErr},
    net::{OutputBlob, TestNet},
};

const ROW_WIDTH: usize = 5;

type Detections = BTreeMap<i64, Vec<(f64, u32)>>;

/// Detection bookkeeping of a single test run, keyed by output index then label.
#[derive(Debug, Default)]
pub struct DetectionStats {
    true_pos: BTreeMap<usize, Detections>,
    false_pos: BTreeMap<usize, Detections>,
    num_pos: BTreeMap<usize, BTreeMap<i64, usize>>,
}

impl DetectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every row of a detection output.
    ///
    /// Rows with an item id of -1 carry the ground truth count of their label,
    /// every other row is a `[item_id, label, score, tp, fp]` detection. Rows
    /// that are neither a true nor a false positive are dropped.
    ///
    /// # Arguments
    /// * `output` - The index of the output among the net's outputs.
    /// * `blob` - The output's contents after a forward pass.
    ///
    /// # Returns
    /// A consistency error if the output isn't made of detection rows.
    pub fn record<T: Scalar>(&mut self, output: usize, blob: &OutputBlob<T>) -> Result<()> {
        if blob.width != ROW_WIDTH || blob.data.len() % ROW_WIDTH != 0 {
            return Err(SolverErr::Consistency(format!(
                "detection output {} must have rows of width {ROW_WIDTH}, got width {} with {} elements",
                blob.name,
                blob.width,
                blob.data.len()
            )));
        }

        for row in blob.rows() {
            let item_id = row[0].to_f64() as i64;
            let label = row[1].to_f64() as i64;

            if item_id == -1 {
                *self
                    .num_pos
                    .entry(output)
                    .or_default()
                    .entry(label)
                    .or_default() += row[2].to_f64() as usize;
                continue;
            }

            let score = row[2].to_f64();
            let tp = row[3].to_f64() as u32;
            let fp = row[4].to_f64() as u32;
            if tp == 0 && fp == 0 {
                continue;
            }

            self.true_pos
                .entry(output)
                .or_default()
                .entry(label)
                .or_default()
                .push((score, tp));

            self.false_pos
                .entry(output)
                .or_default()
                .entry(label)
                .or_default()
                .push((score, fp));
        }

        Ok(())
    }

    /// Computes the mean average precision of every output.
    ///
    /// The mean is taken over the labels whose AP could be computed, labels
    /// missing their detections are skipped with a warning. An output that only
    /// saw ground truth rows has every label skipped and scores 0.
    ///
    /// # Arguments
    /// * `version` - The AP integration policy.
    ///
    /// # Returns
    /// The mAP by output index, or a consistency error if an output has
    /// detections but no positive counts, or only one half of its tp/fp lists.
    pub fn mean_average_precision(&self, version: ApVersion) -> Result<BTreeMap<usize, f64>> {
        let empty = Detections::new();
        let outputs = self
            .true_pos
            .keys()
            .chain(self.false_pos.keys())
            .chain(self.num_pos.keys());

        let mut maps = BTreeMap::new();
        for &output in outputs {
            if maps.contains_key(&output) {
                continue;
            }

            let missing = |what: &str| {
                SolverErr::Consistency(format!("missing {what} of detection output {output}"))
            };

            let num_pos = self.num_pos.get(&output).ok_or_else(|| missing("positive counts"))?;
            let detections = (self.true_pos.get(&output), self.false_pos.get(&output));
            let (true_pos, false_pos) = match detections {
                (Some(tp), Some(fp)) => (tp, fp),
                (None, None) => (&empty, &empty),
                (None, Some(_)) => return Err(missing("true positives")),
                (Some(_), None) => return Err(missing("false positives")),
            };

            let mut sum = 0.0;
            let mut computed = 0;
            for (&label, &label_num_pos) in num_pos {
                let Some(tp) = true_pos.get(&label) else {
                    warn!(output = output, label = label; "missing true positives, skipping label");
                    continue;
                };

                let Some(fp) = false_pos.get(&label) else {
                    warn!(output = output, label = label; "missing false positives, skipping label");
                    continue;
                };

                let (ap, _) = average_precision(tp, fp, label_num_pos, version)?;
                debug!(output = output, label = label; "average precision {ap}");
                sum += ap;
                computed += 1;
            }

            let map = if computed > 0 {
                sum / computed as f64
            } else {
                0.0
            };
            maps.insert(output, map);
        }

        Ok(maps)
    }
}

/// Evaluates a detection test net.
///
/// Detections of every pass are pooled on this worker, the group isn't involved.
///
/// # Arguments
/// * `net` - The test net, already sharing the trained weights.
/// * `spec` - The test run to perform.
/// * `poll` - Called before each pass, `Break` interrupts the run.
///
/// # Returns
/// One mAP score per output, `Interrupted` if the run was cut short.
pub fn detect<T: Scalar>(
    net: &mut dyn TestNet<T>,
    spec: &TestRunSpec,
    poll: &mut (dyn FnMut() -> ControlFlow<()> + Send),
) -> Result<TestOutcome<T>> {
    let mut stats = DetectionStats::new();
    let mut names = Vec::new();
    let mut loss = T::default();

    for pass in 0..spec.iterations {
        if poll().is_break() {
            debug!(test_net = spec.net_id, pass = pass; "test run interrupted");
            return Ok(TestOutcome::Interrupted);
        }

        let pass_loss = net.forward()?;
        if spec.compute_loss {
            loss += pass_loss;
        }

        let outputs = net.outputs();
        if pass == 0 {
            names = outputs.iter().map(|output| output.name.clone()).collect();
        }

        for (i, output) in outputs.iter().enumerate() {
            stats.record(i, output)?;
        }
    }

    let scores = stats
        .mean_average_precision(spec.ap_version)?
        .into_iter()
        .map(|(output, map)| OutputScore {
            name: names
                .get(output)
                .cloned()
                .unwrap_or_else(|| format!("output{output}")),
            value: T::from_f64(map),
            loss_weight: T::default(),
        })
        .collect();

    let iterations = T::from_usize(spec.iterations.max(1));
    Ok(TestOutcome::Completed(TestReport {
        net_id: spec.net_id,
        loss: spec.compute_loss.then(|| loss / iterations),
        scores,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{evaluation::EvalType, net::ParamBlob};

    fn rows(rows: &[[f64; 5]]) -> OutputBlob<f64> {
        OutputBlob::new("detection_eval", rows.concat()).with_width(ROW_WIDTH)
    }

    #[test]
    fn unmatched_rows_are_dropped_and_positives_summed() {
        let mut stats = DetectionStats::new();
        stats
            .record(
                0,
                &rows(&[
                    [-1.0, 1.0, 6.0, -1.0, -1.0],
                    [0.0, 1.0, 0.9, 1.0, 0.0],
                    [0.0, 1.0, 0.7, 0.0, 0.0],
                    [1.0, 1.0, 0.8, 0.0, 1.0],
                ]),
            )
            .unwrap();
        stats
            .record(
                0,
                &rows(&[[-1.0, 1.0, 4.0, -1.0, -1.0], [2.0, 1.0, 0.5, 1.0, 0.0]]),
            )
            .unwrap();

        assert_eq!(stats.num_pos[&0][&1], 10);
        assert_eq!(stats.true_pos[&0][&1], vec![(0.9, 1), (0.8, 0), (0.5, 1)]);
        assert_eq!(stats.false_pos[&0][&1], vec![(0.9, 0), (0.8, 1), (0.5, 0)]);

        let maps = stats.mean_average_precision(ApVersion::Integral).unwrap();
        let want = 0.1 + 0.1 * 2.0 / 3.0;
        assert!((maps[&0] - want).abs() < 1e-9);
    }

    #[test]
    fn labels_without_detections_are_skipped() {
        let mut stats = DetectionStats::new();
        stats
            .record(
                0,
                &rows(&[
                    [-1.0, 1.0, 1.0, -1.0, -1.0],
                    [-1.0, 2.0, 3.0, -1.0, -1.0],
                    [0.0, 1.0, 0.9, 1.0, 0.0],
                ]),
            )
            .unwrap();

        let maps = stats.mean_average_precision(ApVersion::MaxIntegral).unwrap();
        assert!((maps[&0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn outputs_with_detections_but_no_positive_counts_are_fatal() {
        let mut stats = DetectionStats::new();
        stats
            .record(0, &rows(&[[-1.0, 1.0, 1.0, -1.0, -1.0]]))
            .unwrap();
        stats.record(1, &rows(&[[0.0, 1.0, 0.9, 1.0, 0.0]])).unwrap();

        assert!(matches!(
            stats.mean_average_precision(ApVersion::Integral),
            Err(SolverErr::Consistency(_))
        ));
    }

    #[test]
    fn outputs_without_detections_score_zero() {
        let mut stats = DetectionStats::new();
        stats
            .record(
                0,
                &rows(&[[-1.0, 1.0, 3.0, -1.0, -1.0], [0.0, 1.0, 0.6, 0.0, 0.0]]),
            )
            .unwrap();
        stats
            .record(0, &rows(&[[-1.0, 2.0, 2.0, -1.0, -1.0]]))
            .unwrap();

        let maps = stats.mean_average_precision(ApVersion::Integral).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[&0], 0.0);
    }

    #[test]
    fn eleven_point_policy_samples_the_precision_curve() {
        let mut stats = DetectionStats::new();
        stats
            .record(
                0,
                &rows(&[
                    [-1.0, 1.0, 2.0, -1.0, -1.0],
                    [0.0, 1.0, 0.9, 1.0, 0.0],
                    [1.0, 1.0, 0.8, 0.0, 1.0],
                    [2.0, 1.0, 0.7, 1.0, 0.0],
                ]),
            )
            .unwrap();

        // Precision is 1 up to recall 0.5 and 2/3 at recall 1.
        let maps = stats.mean_average_precision(ApVersion::ElevenPoint).unwrap();
        let want = (6.0 + 5.0 * 2.0 / 3.0) / 11.0;
        assert!((maps[&0] - want).abs() < 1e-9);
    }

    #[test]
    fn rows_must_have_five_columns() {
        let mut stats = DetectionStats::new();
        let blob = OutputBlob::new("bad", vec![0.0_f32; 8]).with_width(4);
        assert!(matches!(stats.record(0, &blob), Err(SolverErr::Consistency(_))));
    }

    struct ReplayNet {
        passes: Vec<Vec<OutputBlob<f64>>>,
        current: usize,
    }

    impl TestNet<f64> for ReplayNet {
        fn share_trained_layers_with(&mut self, _: &[ParamBlob<f64>]) -> Result<()> {
            Ok(())
        }

        fn forward(&mut self) -> Result<f64> {
            self.current += 1;
            Ok(self.current as f64)
        }

        fn outputs(&self) -> &[OutputBlob<f64>] {
            &self.passes[self.current - 1]
        }
    }

    #[test]
    fn detection_runs_pool_every_pass() {
        let mut net = ReplayNet {
            passes: vec![
                vec![rows(&[[-1.0, 3.0, 2.0, -1.0, -1.0], [0.0, 3.0, 0.9, 1.0, 0.0]])],
                vec![rows(&[[1.0, 3.0, 0.4, 1.0, 0.0]])],
            ],
            current: 0,
        };

        let spec = TestRunSpec {
            net_id: 1,
            iterations: 2,
            compute_loss: true,
            eval_type: EvalType::Detection,
            ap_version: ApVersion::Integral,
        };

        let outcome = detect(&mut net, &spec, &mut || ControlFlow::Continue(())).unwrap();
        let report = outcome.report().unwrap();

        assert_eq!(report.net_id, 1);
        assert_eq!(report.scores.len(), 1);
        assert_eq!(report.scores[0].name, "detection_eval");
        assert!((report.scores[0].value - 1.0).abs() < 1e-9);
        assert_eq!(report.loss, Some(1.5));
    }

    fn spec(iterations: usize, ap_version: ApVersion) -> TestRunSpec {
        TestRunSpec {
            net_id: 0,
            iterations,
            compute_loss: false,
            eval_type: EvalType::Detection,
            ap_version,
        }
    }

    #[test]
    fn ground_truth_only_passes_complete_with_zero_map() {
        let mut net = ReplayNet {
            passes: vec![
                vec![rows(&[[-1.0, 1.0, 3.0, -1.0, -1.0]])],
                vec![rows(&[[-1.0, 2.0, 2.0, -1.0, -1.0]])],
            ],
            current: 0,
        };

        let outcome = detect(&mut net, &spec(2, ApVersion::Integral), &mut || {
            ControlFlow::Continue(())
        })
        .unwrap();

        let report = outcome.report().unwrap();
        assert_eq!(report.loss, None);
        assert_eq!(report.scores.len(), 1);
        assert_eq!(report.scores[0].value, 0.0);
    }

    #[test]
    fn stop_before_a_pass_interrupts_the_detection_run() {
        let mut net = ReplayNet {
            passes: vec![vec![rows(&[[-1.0, 1.0, 1.0, -1.0, -1.0], [0.0, 1.0, 0.9, 1.0, 0.0]])]; 3],
            current: 0,
        };

        let mut polls = 0;
        let outcome = detect(&mut net, &spec(3, ApVersion::ElevenPoint), &mut || {
            polls += 1;
            if polls == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();

        assert!(matches!(outcome, TestOutcome::Interrupted));
        assert!(outcome.report().is_none());
        assert_eq!(net.current, 1);
    }

    #[test]
    fn eleven_point_runs_report_every_output() {
        let mut net = ReplayNet {
            passes: vec![vec![
                rows(&[[-1.0, 1.0, 1.0, -1.0, -1.0], [0.0, 1.0, 0.9, 1.0, 0.0]]),
                rows(&[[-1.0, 1.0, 2.0, -1.0, -1.0], [0.0, 1.0, 0.9, 1.0, 0.0]]),
            ]],
            current: 0,
        };

        let outcome = detect(&mut net, &spec(1, ApVersion::ElevenPoint), &mut || {
            ControlFlow::Continue(())
        })
        .unwrap();

        let scores = &outcome.report().unwrap().scores;
        assert_eq!(scores.len(), 2);
        assert!((scores[0].value - 1.0).abs() < 1e-9);
        // Recall tops out at 0.5, six of the eleven samples see precision 1.
        assert!((scores[1].value - 6.0 / 11.0).abs() < 1e-9);
    }
}
