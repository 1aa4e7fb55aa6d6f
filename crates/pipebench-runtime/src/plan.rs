//! Picks the stage a run executes and sizes the host staging buffers.

use pipebench_core::StageSpec;
use tracing::debug;

use crate::{BenchError, BenchResult};

#[derive(Clone, Debug)]
pub struct RunPlan {
    pub stage_index: usize,
    pub stage: StageSpec,
    pub batch: usize,
    /// Every stage's input shapes, `AxBxC;` each, in stage order.
    pub shape_info: String,
    /// Largest input tensor over all stages, in bytes.
    pub largest_input: usize,
    /// Largest output tensor over all stages, in bytes.
    pub largest_output: usize,
}

impl RunPlan {
    /// Validate `stages` and select the one serving `requested_batch`.
    ///
    /// Without a requested batch the last stage's batch is used. When several
    /// stages share a batch size the last of them wins.
    pub fn new(stages: &[StageSpec], requested_batch: Option<usize>) -> BenchResult<Self> {
        let last = stages.last().ok_or(BenchError::NoStages)?;
        check_stage_consistency(stages)?;

        let mut batches = Vec::with_capacity(stages.len());
        for (idx, stage) in stages.iter().enumerate() {
            let batch = stage.batch().ok_or_else(|| BenchError::StageMismatch {
                stage: idx,
                reason: "first input has no batch dimension".to_string(),
            })?;
            batches.push(batch);
        }

        let batch = match requested_batch {
            Some(batch) => batch,
            None => last.batch().unwrap_or_default(),
        };
        let stage_index = batches
            .iter()
            .rposition(|b| *b == batch)
            .ok_or_else(|| BenchError::BatchNotFound {
                batch,
                available: batches.clone(),
            })?;

        let plan = Self {
            stage_index,
            stage: stages[stage_index].clone(),
            batch,
            shape_info: shape_info(stages),
            largest_input: stages.iter().map(StageSpec::largest_input).max().unwrap_or(0),
            largest_output: stages.iter().map(StageSpec::largest_output).max().unwrap_or(0),
        };
        debug!(
            stage = plan.stage_index,
            batch = plan.batch,
            largest_input = plan.largest_input,
            largest_output = plan.largest_output,
            "selected run stage"
        );
        Ok(plan)
    }
}

fn check_stage_consistency(stages: &[StageSpec]) -> BenchResult<()> {
    for (idx, pair) in stages.windows(2).enumerate() {
        let (prev, cur) = (&pair[0], &pair[1]);
        let stage = idx + 1;
        let mismatch = |reason: String| BenchError::StageMismatch { stage, reason };

        if cur.inputs.len() != prev.inputs.len() {
            return Err(mismatch(format!(
                "{} inputs, previous stage has {}",
                cur.inputs.len(),
                prev.inputs.len()
            )));
        }
        if cur.outputs.len() != prev.outputs.len() {
            return Err(mismatch(format!(
                "{} outputs, previous stage has {}",
                cur.outputs.len(),
                prev.outputs.len()
            )));
        }
        for (slot, (p, c)) in prev.inputs.iter().zip(&cur.inputs).enumerate() {
            if c.shape.rank() != p.shape.rank() {
                return Err(mismatch(format!(
                    "input {slot} has rank {}, previous stage has {}",
                    c.shape.rank(),
                    p.shape.rank()
                )));
            }
            if !c.shape.same_sample_shape(&p.shape) {
                return Err(mismatch(format!(
                    "input {slot} shape {} differs from {} outside the batch dimension",
                    c.shape, p.shape
                )));
            }
            if c.dtype != p.dtype {
                return Err(mismatch(format!(
                    "input {slot} dtype {:?} differs from {:?}",
                    c.dtype, p.dtype
                )));
            }
        }
    }
    Ok(())
}

fn shape_info(stages: &[StageSpec]) -> String {
    let mut info = String::new();
    for stage in stages {
        for input in &stage.inputs {
            info.push_str(&input.shape.to_string());
            info.push(';');
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use pipebench_core::{DType, TensorSpec};

    use super::*;

    fn stage(batch: usize) -> StageSpec {
        StageSpec {
            inputs: vec![TensorSpec::new("x", DType::F32, &[batch, 3, 8, 8])],
            outputs: vec![TensorSpec::new("y", DType::F32, &[batch, 10])],
        }
    }

    #[test]
    fn defaults_to_last_stage_batch() {
        let plan = RunPlan::new(&[stage(1), stage(4)], None).unwrap();
        assert_eq!(plan.batch, 4);
        assert_eq!(plan.stage_index, 1);
        assert_eq!(plan.shape_info, "1x3x8x8;4x3x8x8;");
        assert_eq!(plan.largest_input, 4 * 3 * 8 * 8 * 4);
        assert_eq!(plan.largest_output, 4 * 10 * 4);
    }

    #[test]
    fn requested_batch_selects_matching_stage() {
        let plan = RunPlan::new(&[stage(1), stage(4), stage(8)], Some(4)).unwrap();
        assert_eq!(plan.stage_index, 1);
        assert_eq!(plan.stage, stage(4));
        // Buffers are still sized for the largest stage.
        assert_eq!(plan.largest_input, 8 * 3 * 8 * 8 * 4);
    }

    #[test]
    fn duplicate_batches_pick_the_last_stage() {
        let plan = RunPlan::new(&[stage(2), stage(2)], Some(2)).unwrap();
        assert_eq!(plan.stage_index, 1);
    }

    #[test]
    fn missing_batch_is_an_error() {
        let err = RunPlan::new(&[stage(1), stage(4)], Some(3)).unwrap_err();
        match err {
            BenchError::BatchNotFound { batch, available } => {
                assert_eq!(batch, 3);
                assert_eq!(available, vec![1, 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_stages_is_an_error() {
        assert!(matches!(RunPlan::new(&[], None), Err(BenchError::NoStages)));
    }

    #[test]
    fn sample_shape_change_is_rejected() {
        let mut odd = stage(4);
        odd.inputs[0] = TensorSpec::new("x", DType::F32, &[4, 3, 8, 9]);
        let err = RunPlan::new(&[stage(1), odd], None).unwrap_err();
        assert!(matches!(err, BenchError::StageMismatch { stage: 1, .. }));
    }

    #[test]
    fn rank_change_is_rejected() {
        let mut odd = stage(4);
        odd.inputs[0] = TensorSpec::new("x", DType::F32, &[4, 192]);
        let err = RunPlan::new(&[stage(1), odd], None).unwrap_err();
        match err {
            BenchError::StageMismatch { reason, .. } => assert!(reason.contains("rank")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn io_count_change_is_rejected() {
        let mut odd = stage(4);
        odd.outputs.push(TensorSpec::new("z", DType::F32, &[4]));
        let err = RunPlan::new(&[stage(1), odd], None).unwrap_err();
        assert!(matches!(err, BenchError::StageMismatch { stage: 1, .. }));
    }

    #[test]
    fn scalar_first_input_has_no_batch() {
        let scalar = StageSpec {
            inputs: vec![TensorSpec::new("x", DType::F32, &[])],
            outputs: Vec::new(),
        };
        let err = RunPlan::new(&[scalar], None).unwrap_err();
        assert!(matches!(err, BenchError::StageMismatch { stage: 0, .. }));
    }
}
