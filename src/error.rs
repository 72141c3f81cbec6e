use rayon::ThreadPoolBuildError;
use std::io;
use std::sync::PoisonError;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("{0}")]
    ThreadPoolBuildError(#[from] ThreadPoolBuildError),

    #[error("{0}")]
    FsError(#[from] fs_extra::error::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("memtable insert failed after {attempts} attempts")]
    WriteContention { attempts: usize },

    #[error("timed out after {0:?} waiting for table rotation to complete")]
    Timeout(Duration),

    #[error("background task failed: {0}")]
    BackgroundTask(String),

    #[error("store is closed")]
    Closed,

    #[error("{0}")]
    Custom(String),
}

impl<T> From<PoisonError<T>> for StrataError {
    fn from(_: PoisonError<T>) -> Self {
        StrataError::Custom("lock poisoned".into())
    }
}

impl PartialEq for StrataError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IOError(_), Self::IOError(_))
            | (Self::FsError(_), Self::FsError(_))
            | (Self::Closed, Self::Closed) => true,
            (Self::Timeout(d1), Self::Timeout(d2)) => d1.eq(d2),
            (Self::WriteContention { attempts: a1 }, Self::WriteContention { attempts: a2 }) => {
                a1.eq(a2)
            }
            (Self::Corruption(s1), Self::Corruption(s2))
            | (Self::BackgroundTask(s1), Self::BackgroundTask(s2))
            | (Self::Custom(s1), Self::Custom(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
