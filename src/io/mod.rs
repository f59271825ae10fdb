//! I/O for input series and Zarr result containers.

mod result_reader;
mod result_writer;
mod series;
mod store;

pub use result_reader::CoherenceResultReader;
pub use result_writer::{
    ResultLayout, ResultSink, ScalarMetadata, WriteCursor, WriterState, ZarrResultWriter,
    RESULT_DATA_PATH, RESULT_FREQUENCY_PATH, SEALED_ATTRIBUTE,
};
pub use series::{
    InMemorySeries, SeriesAttributes, SeriesReader, SliceIndex, ZarrSeriesReader, ZarrSeriesWriter,
    SERIES_DATA_PATH,
};
pub use store::{
    create_store, open_store, prepare_destination, remove_dir_if_exists, writer_lock_path, PreparedDestination,
    WRITER_LOCK_SUFFIX,
};
