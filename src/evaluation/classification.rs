use std::ops::ControlFlow;

use comms::Scalar;
use log::debug;

use super::{OutputScore, TestOutcome, TestReport, TestRunSpec};
use crate::{
    collective::Collective,
    error::{Result, SolverErr},
    net::TestNet,
};

/// Name, loss weight and element count of an output, captured on the first pass.
struct OutputLayout<T> {
    name: String,
    loss_weight: T,
    len: usize,
}

/// Sums every output element over the passes.
struct ScoreAccumulator<T> {
    layout: Vec<OutputLayout<T>>,
    scores: Vec<T>,
    loss: T,
}

impl<T: Scalar> ScoreAccumulator<T> {
    fn new() -> Self {
        Self {
            layout: Vec::new(),
            scores: Vec::new(),
            loss: T::default(),
        }
    }

    fn add_pass(&mut self, net: &dyn TestNet<T>, first: bool) -> Result<()> {
        let outputs = net.outputs();

        if first {
            self.layout = outputs
                .iter()
                .map(|output| OutputLayout {
                    name: output.name.clone(),
                    loss_weight: output.loss_weight,
                    len: output.data.len(),
                })
                .collect();

            self.scores = outputs
                .iter()
                .flat_map(|output| output.data.iter().copied())
                .collect();

            return Ok(());
        }

        let mut offset = 0;
        for (i, output) in outputs.iter().enumerate() {
            let expected = self.layout.get(i).map(|layout| layout.len);
            if expected != Some(output.data.len()) {
                return Err(SolverErr::Consistency(format!(
                    "output {} changed its size between passes: got {}, expected {expected:?}",
                    output.name,
                    output.data.len()
                )));
            }

            for (acc, &x) in self.scores[offset..].iter_mut().zip(&output.data) {
                *acc += x;
            }
            offset += output.data.len();
        }

        if outputs.len() != self.layout.len() {
            return Err(SolverErr::Consistency(format!(
                "test net produced {} outputs, expected {}",
                outputs.len(),
                self.layout.len()
            )));
        }

        Ok(())
    }

    fn into_report(self, spec: &TestRunSpec, divisor: T) -> TestReport<T> {
        let mut scores = self.scores.into_iter();
        let mut report = Vec::with_capacity(scores.len());

        for layout in &self.layout {
            for (k, value) in scores.by_ref().take(layout.len).enumerate() {
                let name = if layout.len == 1 {
                    layout.name.clone()
                } else {
                    format!("{}[{k}]", layout.name)
                };

                report.push(OutputScore {
                    name,
                    value: value / divisor,
                    loss_weight: layout.loss_weight,
                });
            }
        }

        TestReport {
            net_id: spec.net_id,
            loss: spec.compute_loss.then(|| self.loss / divisor),
            scores: report,
        }
    }
}

/// Evaluates a classification test net.
///
/// Runs `spec.iterations` forward passes and averages every output element, and
/// the loss if requested. With more than one worker the sums are reduced across
/// the group first, so every worker reports the same means.
///
/// # Arguments
/// * `net` - The test net, already sharing the trained weights.
/// * `spec` - The test run to perform.
/// * `collective` - The worker group.
/// * `poll` - Called before each pass, `Break` interrupts the run.
///
/// # Returns
/// The report of the run, `Interrupted` if it was cut short.
pub async fn classify<T, C>(
    net: &mut dyn TestNet<T>,
    spec: &TestRunSpec,
    collective: &mut C,
    poll: &mut (dyn FnMut() -> ControlFlow<()> + Send),
) -> Result<TestOutcome<T>>
where
    T: Scalar,
    C: Collective<T>,
{
    let mut acc = ScoreAccumulator::new();

    for pass in 0..spec.iterations {
        if poll().is_break() {
            debug!(test_net = spec.net_id, pass = pass; "test run interrupted");
            return Ok(TestOutcome::Interrupted);
        }

        let loss = net.forward()?;
        if spec.compute_loss {
            acc.loss += loss;
        }

        acc.add_pass(net, pass == 0)?;
    }

    let world_size = collective.world_size();
    if world_size > 1 {
        let mut buf = std::mem::take(&mut acc.scores);
        buf.push(acc.loss);
        collective.all_reduce_sum(&mut buf).await?;

        acc.loss = buf.pop().unwrap_or_default();
        acc.scores = buf;
    }

    let divisor = T::from_usize(spec.iterations * world_size);
    Ok(TestOutcome::Completed(acc.into_report(spec, divisor)))
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::{
        collective::LocalGroup,
        evaluation::{ApVersion, EvalType},
        net::{OutputBlob, ParamBlob},
    };

    struct ConstantNet {
        outputs: Vec<OutputBlob<f32>>,
        loss: f32,
        passes: usize,
    }

    impl ConstantNet {
        fn new(scores: Vec<f32>, loss: f32) -> Self {
            let outputs = vec![
                OutputBlob::new("prob", scores),
                OutputBlob::new("loss", vec![loss]).with_loss_weight(1.0),
            ];
            Self {
                outputs,
                loss,
                passes: 0,
            }
        }
    }

    impl TestNet<f32> for ConstantNet {
        fn share_trained_layers_with(&mut self, _: &[ParamBlob<f32>]) -> Result<()> {
            Ok(())
        }

        fn forward(&mut self) -> Result<f32> {
            self.passes += 1;
            Ok(self.loss)
        }

        fn outputs(&self) -> &[OutputBlob<f32>] {
            &self.outputs
        }
    }

    fn spec(iterations: usize) -> TestRunSpec {
        TestRunSpec {
            net_id: 0,
            iterations,
            compute_loss: true,
            eval_type: EvalType::Classification,
            ap_version: ApVersion::Integral,
        }
    }

    #[tokio::test]
    async fn constant_outputs_average_to_themselves() {
        let mut group = LocalGroup::new::<f32>(1);
        let mut net = ConstantNet::new(vec![0.2, 0.8], 0.5);

        let outcome = classify(&mut net, &spec(4), &mut group[0], &mut || ControlFlow::Continue(()))
            .await
            .unwrap();

        let report = outcome.report().unwrap();
        let values: Vec<_> = report.scores.iter().map(|s| s.value).collect();
        assert!((values[0] - 0.2).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
        assert!((values[2] - 0.5).abs() < 1e-6);
        assert_eq!(report.scores[0].name, "prob[0]");
        assert_eq!(report.scores[2].name, "loss");
        assert_eq!(report.scores[2].loss_weight, 1.0);
        assert!((report.loss.unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(net.passes, 4);
    }

    #[tokio::test]
    async fn stop_before_a_pass_interrupts_the_run() {
        let mut group = LocalGroup::new::<f32>(1);
        let mut net = ConstantNet::new(vec![0.2, 0.8], 0.5);

        let mut polls = 0;
        let mut poll = || {
            polls += 1;
            if polls == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };

        let outcome = classify(&mut net, &spec(4), &mut group[0], &mut poll)
            .await
            .unwrap();

        assert!(outcome.is_interrupted());
        assert_eq!(net.passes, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scores_are_averaged_over_the_group() {
        let inputs = [(vec![0.2, 0.8], 1.0), (vec![0.4, 0.6], 3.0)];

        let handles = LocalGroup::new::<f32>(2)
            .into_iter()
            .zip(inputs)
            .map(|(mut worker, (scores, loss))| {
                tokio::spawn(async move {
                    let mut net = ConstantNet::new(scores, loss);
                    let outcome = classify(&mut net, &spec(2), &mut worker, &mut || {
                        ControlFlow::Continue(())
                    })
                    .await
                    .unwrap();
                    (worker, outcome)
                })
            });

        for res in join_all(handles).await {
            let (_, outcome) = res.unwrap();
            let report = outcome.report().unwrap();
            assert!((report.scores[0].value - 0.3).abs() < 1e-6);
            assert!((report.scores[1].value - 0.7).abs() < 1e-6);
            assert!((report.loss.unwrap() - 2.0).abs() < 1e-6);
        }
    }
}
