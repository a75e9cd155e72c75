//! Frame-level visibility: culling, prioritized traversal, budgets and the
//! per-frame pass that ties them to residency and loading

pub mod host;
pub mod culler;
pub mod budget;
pub mod scheduler;
pub mod pass;

pub use host::{GpuHandle, NullHost, RenderHost};
pub use culler::{CullStructure, FrustumCuller};
pub use budget::{BudgetEnforcer, BudgetLimits, Rejection};
pub use scheduler::{Candidate, CandidateQueue, PriorityScheduler, Selection, Traversal, ViewParams, child_weight};
pub use pass::{FrameReport, PassState, VisibilityPass, VisibleNode};
