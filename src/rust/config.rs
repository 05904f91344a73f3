// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Deadline scheduler tunables. These are captured once, when the scheduler module is loaded.
mod deadline_config {
    pub const SECTION_NAME: &str = "deadline";
    pub const READ_EXPIRE: &str = "read_expire_ms";
    pub const FIFO_BATCH: &str = "fifo_batch";
    pub const SEEK_COST: &str = "seek_cost";
    pub const WRITES_STARVED: &str = "writes_starved";
}

// Request queue limits. These apply to every queue created from this configuration.
mod queue_config {
    pub const SECTION_NAME: &str = "queue";
    pub const NR_REQUESTS: &str = "nr_requests";
    pub const MAX_SECTORS: &str = "max_sectors";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// I/O scheduling configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Common associated functions for I/O scheduling configuration objects.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration document.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {}", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_deadline_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, deadline_config::SECTION_NAME)
    }

    fn get_queue_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, queue_config::SECTION_NAME)
    }

    /// Deadline config: Reads how long a read may stay queued before it is served ahead of the sector order.
    pub fn read_expire(&self) -> Result<Duration, Fail> {
        let millis: u64 = if let Some(millis) = Self::get_typed_env_option(deadline_config::READ_EXPIRE)? {
            millis
        } else {
            Self::get_int_option(self.get_deadline_config()?, deadline_config::READ_EXPIRE)?
        };
        Ok(Duration::from_millis(millis))
    }

    /// Deadline config: Reads the cost budget of a single dispatch batch.
    pub fn fifo_batch(&self) -> Result<u32, Fail> {
        if let Some(fifo_batch) = Self::get_typed_env_option(deadline_config::FIFO_BATCH)? {
            Ok(fifo_batch)
        } else {
            Self::get_int_option(self.get_deadline_config()?, deadline_config::FIFO_BATCH)
        }
    }

    /// Deadline config: Reads the cost charged for a request that is not contiguous with the previous one.
    pub fn seek_cost(&self) -> Result<u32, Fail> {
        let seek_cost: u32 = if let Some(seek_cost) = Self::get_typed_env_option(deadline_config::SEEK_COST)? {
            seek_cost
        } else {
            Self::get_int_option(self.get_deadline_config()?, deadline_config::SEEK_COST)?
        };

        if seek_cost == 0 {
            let cause: String = format!("parameter \"{}\" must be positive", deadline_config::SEEK_COST);
            error!("seek_cost(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(seek_cost)
    }

    /// Deadline config: Reads how many read batches may be dispatched while writes are pending.
    pub fn writes_starved(&self) -> Result<u32, Fail> {
        if let Some(writes_starved) = Self::get_typed_env_option(deadline_config::WRITES_STARVED)? {
            Ok(writes_starved)
        } else {
            Self::get_int_option(self.get_deadline_config()?, deadline_config::WRITES_STARVED)
        }
    }

    /// Queue config: Reads the number of request slots in the free pool of a queue.
    pub fn nr_requests(&self) -> Result<usize, Fail> {
        let nr_requests: usize = if let Some(nr_requests) = Self::get_typed_env_option(queue_config::NR_REQUESTS)? {
            nr_requests
        } else {
            Self::get_int_option(self.get_queue_config()?, queue_config::NR_REQUESTS)?
        };

        if nr_requests == 0 {
            let cause: String = format!("parameter \"{}\" must be positive", queue_config::NR_REQUESTS);
            error!("nr_requests(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(nr_requests)
    }

    /// Queue config: Reads the largest request, in sectors, that merging may build.
    pub fn max_sectors(&self) -> Result<u64, Fail> {
        if let Some(max_sectors) = Self::get_typed_env_option(queue_config::MAX_SECTORS)? {
            Ok(max_sectors)
        } else {
            Self::get_int_option(self.get_queue_config()?, queue_config::MAX_SECTORS)
        }
    }

    //======================================================================================================================
    // Static Functions
    //======================================================================================================================

    /// Similar to `get_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
