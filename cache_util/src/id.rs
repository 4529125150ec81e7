//! Small newtype ids used at the engine's external boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! uuid_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

// A `cachePrepareData`/`cacheCancelPrepareData`/`cacheCheckPrepareStatus` request id.
uuid_id_newtype!(RequestId);

// An opaque `dfsOpenFile` handle id, returned to callers across the facade boundary.
uuid_id_newtype!(FileHandleId);
