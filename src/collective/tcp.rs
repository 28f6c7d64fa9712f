use comms::{
    OnoReceiver, OnoSender, Scalar,
    msg::{self, Command, Msg, Payload},
};
use log::{debug, info};
use tokio::net::{
    TcpListener, TcpStream, ToSocketAddrs,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use super::{Collective, CollectiveErr, Result};

/// Upper bound of a control or error frame.
const MAX_CONTROL_FRAME: usize = 4096;

/// One end of a framed connection between a follower and the hub.
struct Link {
    rank: usize,
    rx: OnoReceiver<OwnedReadHalf>,
    tx: OnoSender<OwnedWriteHalf>,
    buf: Vec<u64>,
}

impl Link {
    fn new(rank: usize, stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
        }
    }

    /// Receives a data frame from the peer and copies it into `out`.
    ///
    /// With `add` set the frame is added elementwise instead.
    async fn recv_data<T: Scalar>(&mut self, out: &mut [T], add: bool) -> Result<()> {
        let rank = self.rank;
        let max = msg::data_frame_len::<T>(out.len()).max(MAX_CONTROL_FRAME);
        self.rx.set_max_frame(Some(max));
        let msg: Msg<T> = self.rx.recv_into(&mut self.buf).await?;

        let nums = match msg {
            Msg::Data(Payload::Grad(nums) | Payload::Params(nums)) => nums,
            Msg::Err(reason) => {
                return Err(CollectiveErr::Aborted {
                    reason: reason.into_owned(),
                });
            }
            Msg::Control(Command::Disconnect) => {
                return Err(CollectiveErr::Aborted {
                    reason: format!("rank {rank} disconnected"),
                });
            }
            other => {
                return Err(CollectiveErr::UnexpectedMessage {
                    rank,
                    got: other.kind(),
                });
            }
        };

        if nums.len() != out.len() {
            return Err(CollectiveErr::LengthMismatch {
                rank,
                got: nums.len(),
                expected: out.len(),
            });
        }

        if add {
            for (acc, &x) in out.iter_mut().zip(nums) {
                *acc += x;
            }
        } else {
            out.copy_from_slice(nums);
        }

        Ok(())
    }

    async fn recv_command<T: Scalar>(&mut self) -> Result<Command> {
        let rank = self.rank;
        self.rx.set_max_frame(Some(MAX_CONTROL_FRAME));
        let msg: Msg<T> = self.rx.recv_into(&mut self.buf).await?;

        match msg {
            Msg::Control(cmd) => Ok(cmd),
            Msg::Err(reason) => Err(CollectiveErr::Aborted {
                reason: reason.into_owned(),
            }),
            other => Err(CollectiveErr::UnexpectedMessage {
                rank,
                got: other.kind(),
            }),
        }
    }
}

enum Role {
    /// Rank 0, connected to every follower. `links[i]` is rank `i + 1`.
    Hub { links: Vec<Link> },
    Follower { hub: Link },
}

/// A worker of a star shaped group over TCP.
///
/// Rank 0 is the hub: it gathers contributions, reduces them in rank order and
/// sends the result back. Any io failure is fatal for the whole group.
pub struct TcpCollective<T> {
    rank: usize,
    world_size: usize,
    role: Role,
    scratch: Vec<T>,
}

impl<T: Scalar> TcpCollective<T> {
    /// Forms the group as rank 0, accepting the other `world_size - 1` workers.
    ///
    /// # Arguments
    /// * `listener` - Where followers connect to.
    /// * `world_size` - The amount of workers in the group, this one included.
    ///
    /// # Returns
    /// The hub's handle once every follower joined.
    pub async fn bind(listener: TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();

        while slots.iter().any(Option::is_none) {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;

            let mut link = Link::new(0, stream);
            let Command::Join {
                rank,
                world_size: theirs,
                scalar,
            } = link.recv_command::<T>().await?
            else {
                return Err(CollectiveErr::UnexpectedMessage {
                    rank: 0,
                    got: "control",
                });
            };

            let refusal = if theirs != world_size {
                Some(format!("group size {theirs} differs from {world_size}"))
            } else if rank == 0 || rank >= world_size {
                Some(format!("rank {rank} is out of the group"))
            } else if slots[rank - 1].is_some() {
                Some(format!("rank {rank} already joined"))
            } else if scalar != T::KIND {
                Some(format!("worker trains with {scalar}, the group with {}", T::KIND))
            } else {
                None
            };

            if let Some(reason) = refusal {
                link.tx.send_err::<T>(&reason).await?;
                return Err(CollectiveErr::Aborted { reason });
            }

            debug!(rank = rank; "worker joined from {addr}");
            link.rank = rank;
            slots[rank - 1] = Some(link);
        }

        let mut links: Vec<Link> = slots.into_iter().flatten().collect();
        for link in &mut links {
            link.tx.send_command::<T>(Command::Ready).await?;
        }

        info!(world_size = world_size; "worker group formed");

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub { links },
            scratch: Vec::new(),
        })
    }

    /// Joins the group whose hub listens on `addr`.
    ///
    /// # Arguments
    /// * `addr` - The hub's address.
    /// * `rank` - This worker's rank, in `1..world_size`.
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// The follower's handle once the hub reported the group as formed.
    pub async fn connect<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut hub = Link::new(0, stream);
        let join = Command::Join {
            rank,
            world_size,
            scalar: T::KIND,
        };
        hub.tx.send_command::<T>(join).await?;

        match hub.recv_command::<T>().await? {
            Command::Ready => {}
            _ => {
                return Err(CollectiveErr::UnexpectedMessage {
                    rank: 0,
                    got: "control",
                });
            }
        }

        debug!(rank = rank; "joined the worker group");

        Ok(Self {
            rank,
            world_size,
            role: Role::Follower { hub },
            scratch: Vec::new(),
        })
    }

    /// Leaves the group, the other workers' next call fails.
    pub async fn shutdown(mut self) -> Result<()> {
        let links = match &mut self.role {
            Role::Hub { links } => links.as_mut_slice(),
            Role::Follower { hub } => std::slice::from_mut(hub),
        };

        for link in links {
            link.tx.disconnect::<T>().await?;
        }

        Ok(())
    }
}

impl<T: Scalar> Collective<T> for TcpCollective<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [T], root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(CollectiveErr::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }

        let rank = self.rank;
        match &mut self.role {
            Role::Hub { links } => {
                if root != 0 {
                    links[root - 1].recv_data(buf, false).await?;
                }

                let buf: &[T] = buf;
                for link in links.iter_mut().filter(|link| link.rank != root) {
                    link.tx.send_data(Payload::Params(buf)).await?;
                }
            }
            Role::Follower { hub } => {
                if rank == root {
                    let buf: &[T] = buf;
                    hub.tx.send_data(Payload::Params(buf)).await?;
                } else {
                    hub.recv_data(buf, false).await?;
                }
            }
        }

        Ok(())
    }

    async fn all_reduce_sum(&mut self, buf: &mut [T]) -> Result<()> {
        match &mut self.role {
            Role::Hub { links } => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);

                for link in links.iter_mut() {
                    link.recv_data(&mut self.scratch, true).await?;
                }

                for link in links.iter_mut() {
                    link.tx.send_data(Payload::Params(self.scratch.as_slice())).await?;
                }

                buf.copy_from_slice(&self.scratch);
            }
            Role::Follower { hub } => {
                let grad: &[T] = buf;
                hub.tx.send_data(Payload::Grad(grad)).await?;
                hub.recv_data(buf, false).await?;
            }
        }

        Ok(())
    }
}
