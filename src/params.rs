use comms::Scalar;
use rayon::prelude::*;

use crate::{
    error::{Result, SolverErr},
    net::ParamBlob,
};

/// Which half of a parameter blob to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Data,
    Diff,
}

impl Field {
    fn of<T>(self, blob: &ParamBlob<T>) -> &[T] {
        match self {
            Field::Data => &blob.data,
            Field::Diff => &blob.diff,
        }
    }

    fn of_mut<T>(self, blob: &mut ParamBlob<T>) -> &mut [T] {
        match self {
            Field::Data => &mut blob.data,
            Field::Diff => &mut blob.diff,
        }
    }
}

/// Packs the model's parameter set into one contiguous buffer and back.
///
/// The layout is captured once from the parameter set and every later call
/// is checked against it, the flat buffer is reused between iterations.
pub struct ParamAggregator<T> {
    counts: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
    flat: Vec<T>,
}

impl<T: Scalar> ParamAggregator<T> {
    /// Creates a new `ParamAggregator`.
    ///
    /// # Arguments
    /// * `params` - The parameter set whose layout to capture.
    ///
    /// # Returns
    /// A new `ParamAggregator` instance.
    pub fn new(params: &[ParamBlob<T>]) -> Self {
        let counts: Vec<_> = params.iter().map(ParamBlob::count).collect();
        let offsets = counts
            .iter()
            .scan(0, |acc, &count| {
                let offset = *acc;
                *acc += count;
                Some(offset)
            })
            .collect();

        let total = counts.iter().sum();

        Self {
            counts,
            offsets,
            total,
            flat: vec![T::default(); total],
        }
    }

    /// The total amount of elements of the parameter set.
    #[inline]
    pub fn len(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Per blob element offsets inside the flat buffer.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Per blob byte offsets inside the flat buffer.
    pub fn byte_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        let size = T::KIND.size();
        self.offsets.iter().map(move |offset| offset * size)
    }

    /// The reused flat buffer.
    pub fn buffer_mut(&mut self) -> &mut [T] {
        &mut self.flat
    }

    /// Copies `field` of every blob into the flat buffer, in declaration order.
    ///
    /// # Arguments
    /// * `params` - The parameter set to read from.
    /// * `field` - Whether to copy the data or the gradients.
    ///
    /// # Returns
    /// The filled flat buffer, or a layout error if the parameter set changed.
    pub fn flatten(&mut self, params: &[ParamBlob<T>], field: Field) -> Result<&mut [T]> {
        self.check_layout(params)?;

        for ((blob, &offset), &count) in params.iter().zip(&self.offsets).zip(&self.counts) {
            self.flat[offset..offset + count].copy_from_slice(field.of(blob));
        }

        Ok(&mut self.flat)
    }

    /// Overwrites `field` of every blob with the flat buffer's contents.
    ///
    /// # Arguments
    /// * `params` - The parameter set to write into.
    /// * `field` - Whether to overwrite the data or the gradients.
    ///
    /// # Returns
    /// A layout error if the parameter set changed since the aggregator was built.
    pub fn scatter(&self, params: &mut [ParamBlob<T>], field: Field) -> Result<()> {
        self.scatter_from(&self.flat, params, field)
    }

    /// Same as `scatter` but reading from an external flat buffer.
    pub fn scatter_from(&self, flat: &[T], params: &mut [ParamBlob<T>], field: Field) -> Result<()> {
        if flat.len() != self.total {
            return Err(SolverErr::SizeMismatch {
                got: flat.len(),
                expected: self.total,
            });
        }

        self.check_layout(params)?;

        params
            .par_iter_mut()
            .zip(self.offsets.par_iter().zip(self.counts.par_iter()))
            .for_each(|(blob, (&offset, &count))| {
                field
                    .of_mut(blob)
                    .copy_from_slice(&flat[offset..offset + count]);
            });

        Ok(())
    }

    fn check_layout(&self, params: &[ParamBlob<T>]) -> Result<()> {
        if params.len() != self.counts.len() {
            return Err(SolverErr::LayoutMismatch {
                blob: params.len().min(self.counts.len()),
                got: params.len(),
                expected: self.counts.len(),
            });
        }

        for (i, (blob, &count)) in params.iter().zip(&self.counts).enumerate() {
            if blob.data.len() != count || blob.diff.len() != count {
                return Err(SolverErr::LayoutMismatch {
                    blob: i,
                    got: blob.data.len().max(blob.diff.len()),
                    expected: count,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn random_params(counts: &[usize]) -> Vec<ParamBlob<f32>> {
        let mut rng = rand::rng();
        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let mut blob = ParamBlob::new(format!("p{i}"), vec![0.0; count]);
                blob.data.iter_mut().for_each(|x| *x = rng.random());
                blob.diff.iter_mut().for_each(|x| *x = rng.random());
                blob
            })
            .collect()
    }

    #[test]
    fn scatter_of_flatten_is_bit_identical() {
        let counts = [3, 0, 17, 1, 64];
        let source = random_params(&counts);
        let mut target = random_params(&counts);

        let mut agg = ParamAggregator::new(&source);
        assert_eq!(agg.len(), 85);
        assert_eq!(agg.offsets(), &[0, 3, 3, 20, 21]);
        assert_eq!(agg.byte_offsets().collect::<Vec<_>>(), vec![0, 12, 12, 80, 84]);

        for field in [Field::Data, Field::Diff] {
            agg.flatten(&source, field).unwrap();
            agg.scatter(&mut target, field).unwrap();
        }

        for (a, b) in source.iter().zip(&target) {
            let bits = |xs: &[f32]| xs.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&a.data), bits(&b.data));
            assert_eq!(bits(&a.diff), bits(&b.diff));
        }
    }

    #[test]
    fn flatten_follows_declaration_order() {
        let params = vec![
            ParamBlob::new("w", vec![1.0_f64, 2.0]),
            ParamBlob::new("b", vec![3.0]),
        ];

        let mut agg = ParamAggregator::new(&params);
        let flat = agg.flatten(&params, Field::Data).unwrap();
        assert_eq!(flat, &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn flatten_refills_the_same_buffer() {
        let mut params = random_params(&[5, 0, 3]);
        let mut agg = ParamAggregator::new(&params);

        let first = agg.flatten(&params, Field::Data).unwrap().as_ptr();

        params[2].data.copy_from_slice(&[7.0, 8.0, 9.0]);
        let flat = agg.flatten(&params, Field::Data).unwrap();
        assert_eq!(flat.as_ptr(), first);
        assert_eq!(flat.len(), 8);
        assert_eq!(&flat[5..], &[7.0, 8.0, 9.0]);
        assert_eq!(&flat[..5], params[0].data.as_slice());
    }

    #[test]
    fn changed_parameter_set_is_rejected() {
        let params = random_params(&[4, 4]);
        let mut agg = ParamAggregator::new(&params);

        let mut grown = random_params(&[4, 5]);
        assert!(matches!(
            agg.flatten(&grown, Field::Diff),
            Err(SolverErr::LayoutMismatch { blob: 1, got: 5, expected: 4 })
        ));
        assert!(agg.scatter(&mut grown, Field::Diff).is_err());

        let mut fewer = random_params(&[4]);
        assert!(agg.scatter(&mut fewer, Field::Data).is_err());

        let short = [0.0_f32; 7];
        assert!(matches!(
            agg.scatter_from(&short, &mut random_params(&[4, 4]), Field::Data),
            Err(SolverErr::SizeMismatch { got: 7, expected: 8 })
        ));
    }
}
