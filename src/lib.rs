//! procmux — launch, supervise, and talk to external processes.
//!
//! The engine multiplexes a child's three standard streams inside one
//! cooperative loop: a composable, lazily-expanded [`InputSource`] is
//! pumped into stdin while stdout and stderr drain into a spooling
//! buffer, under a total and an idle clock, with POSIX signal dispatch
//! and a uniform exit record on every platform.
//!
//! ```no_run
//! use procmux::{Config, Supervisor};
//!
//! # async fn demo() -> procmux::Result<()> {
//! let mut sup = Supervisor::new(Config::shell("cat").input("hello")?);
//! sup.start().await?;
//! let code = sup.wait().await?;
//! assert_eq!(code, 0);
//! assert_eq!(sup.output()?, b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! Output can also be pulled incrementally while the child runs:
//!
//! ```no_run
//! use procmux::{IterFlags, Supervisor};
//!
//! # async fn demo() -> procmux::Result<()> {
//! let mut sup = Supervisor::shell("seq 1 3");
//! let mut iter = sup.iter_output(IterFlags::default());
//! while let Some((channel, chunk)) = iter.next().await? {
//!     println!("{channel}: {}", String::from_utf8_lossy(&chunk));
//! }
//! # Ok(())
//! # }
//! ```

pub mod caps;
pub mod command;
mod config;
mod error;
mod input;
mod iter;
mod output;
mod pipes;
mod supervisor;

pub use config::{CommandSpec, Config, ExitRecord, Mode, SpawnOptions};
pub use error::{Error, Result};
pub use input::{Chunk, InputSource, IntoChunk};
pub use iter::{IterFlags, OutputIter};
pub use pipes::Channel;
pub use supervisor::{DEFAULT_KILL_GRACE, SIGKILL, SIGTERM, State, Supervisor};
