use comms::Scalar;

use super::Result;

/// A group of workers moving flat buffers together.
///
/// Every worker of the group must make the same sequence of calls, each call
/// acts as a barrier and completes only once every worker reached it.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait CollectiveTemplate<T: Scalar> {
    /// The rank of this worker inside the group.
    fn rank(&self) -> usize;

    /// The amount of workers of the group.
    fn world_size(&self) -> usize;

    /// Makes every worker end up with `root`'s contents of `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to send from the root or to overwrite elsewhere.
    /// * `root` - The rank whose buffer is copied.
    ///
    /// # Returns
    /// An error if the group failed or the buffers disagree in length.
    async fn broadcast(&mut self, buf: &mut [T], root: usize) -> Result<()>;

    /// Replaces `buf` with the elementwise sum of every worker's `buf`.
    ///
    /// Contributions are added in rank order so every worker gets a bitwise
    /// identical result.
    ///
    /// # Arguments
    /// * `buf` - This worker's contribution, overwritten with the sum.
    ///
    /// # Returns
    /// An error if the group failed or the buffers disagree in length.
    async fn all_reduce_sum(&mut self, buf: &mut [T]) -> Result<()>;
}

