mod record;

pub use record::{BootstrapRecord, FRAME_LEN, decode_frame, encode_frame, exchange};
