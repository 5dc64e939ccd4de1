pub use anyhow::{bail, ensure, format_err, Context as _, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use derivative::Derivative;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt,
    fmt::Debug,
    iter::{self, Sum},
    num::NonZeroUsize,
    ops::{Add, AddAssign},
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
