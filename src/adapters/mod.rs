//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements             | Connects to                  |
//! |----------------|------------------------|------------------------------|
//! | `sim_board`    | BoardPort              | In-process simulated board   |
//! | `memory_store` | RecordStore            | In-memory map                |
//! | `file_store`   | RecordStore            | postcard / JSON files        |
//! | `event_log`    | EventLog               | JSON-lines file, memory      |
//! | `time`         | Clock                  | Manually driven wall clock   |

pub mod event_log;
pub mod file_store;
pub mod memory_store;
pub mod sim_board;
pub mod time;
