//! Ordered endpoint list with a shared cursor.
//!
//! The router never retries on its own. Callers decide when a failure warrants
//! [`EndpointRouter::advance`]; a per-call [`EndpointSweep`] guarantees each
//! distinct endpoint is tried at most once per logical operation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use url::Url;

/// One candidate backend front-end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: Url,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
        }
    }

    pub fn parse(name: impl Into<String>, raw: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(name, Url::parse(raw)?))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

#[derive(Debug)]
struct Cursor {
    index: usize,
    switches: u64,
}

#[derive(Debug)]
pub struct EndpointRouter {
    endpoints: Vec<Endpoint>,
    cursor: Mutex<Cursor>,
}

impl EndpointRouter {
    /// Returns `None` for an empty list.
    pub fn new(endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            cursor: Mutex::new(Cursor {
                index: 0,
                switches: 0,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn index(&self) -> usize {
        self.cursor.lock().expect("endpoint cursor poisoned").index
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.index()]
    }

    /// Move the cursor circularly and return the new active endpoint.
    pub fn advance(&self) -> &Endpoint {
        let index = {
            let mut cursor = self.cursor.lock().expect("endpoint cursor poisoned");
            cursor.index = (cursor.index + 1) % self.endpoints.len();
            cursor.switches += 1;
            cursor.index
        };
        let endpoint = &self.endpoints[index];
        log::info!("switched to endpoint {endpoint}");
        endpoint
    }

    /// Advance only if the cursor still points at `from`. Concurrent calls that
    /// observed the same failing endpoint then move the cursor once.
    pub fn advance_from(&self, from: usize) -> &Endpoint {
        let index = {
            let mut cursor = self.cursor.lock().expect("endpoint cursor poisoned");
            if cursor.index == from {
                cursor.index = (cursor.index + 1) % self.endpoints.len();
                cursor.switches += 1;
                log::info!("switched to endpoint {}", self.endpoints[cursor.index]);
            }
            cursor.index
        };
        &self.endpoints[index]
    }

    /// Total cursor moves since creation.
    pub fn switches(&self) -> u64 {
        self.cursor.lock().expect("endpoint cursor poisoned").switches
    }

    /// Start a sweep for one logical call.
    pub fn sweep(&self) -> EndpointSweep<'_> {
        EndpointSweep {
            router: self,
            visited: HashSet::new(),
            switches: 0,
        }
    }
}

/// Per-call view over the router that refuses to revisit endpoints.
#[derive(Debug)]
pub struct EndpointSweep<'a> {
    router: &'a EndpointRouter,
    visited: HashSet<usize>,
    switches: u32,
}

impl<'a> EndpointSweep<'a> {
    /// Endpoint to use for the next attempt, or `None` once every endpoint
    /// has been given up on during this call.
    pub fn current(&mut self) -> Option<(usize, &'a Endpoint)> {
        if self.visited.len() >= self.router.len() {
            return None;
        }
        let mut index = self.router.index();
        if self.visited.contains(&index) {
            // Another call moved the cursor back onto an endpoint this call
            // already abandoned.
            index = (0..self.router.len())
                .map(|offset| (index + offset) % self.router.len())
                .find(|candidate| !self.visited.contains(candidate))?;
        }
        Some((index, &self.router.endpoints[index]))
    }

    /// Give up on `index` for this call and move the shared cursor past it.
    pub fn advance(&mut self, index: usize) -> Option<(usize, &'a Endpoint)> {
        self.visited.insert(index);
        if self.visited.len() >= self.router.len() {
            return None;
        }
        self.router.advance_from(index);
        self.switches += 1;
        self.current()
    }

    /// Switches performed by this call.
    pub fn switches(&self) -> u32 {
        self.switches
    }

    /// Distinct endpoints abandoned by this call.
    pub fn attempted(&self) -> usize {
        self.visited.len()
    }

    pub fn exhausted(&self) -> bool {
        self.visited.len() >= self.router.len()
    }
}
