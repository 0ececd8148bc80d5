// Filestore activity consumer.

mod consumer;

pub use consumer::{
    activity_schema, FilestoreConsumer, FilestoreEvent, FILESTORE_ACTIVITY_DATASET,
};
