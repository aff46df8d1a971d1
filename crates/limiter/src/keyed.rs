use crate::{Error, Limiter};
use endpoint::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Extract<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;
type Lookup = Arc<dyn Fn(&str) -> Option<Arc<dyn Limiter>> + Send + Sync>;

/// Per-subject limiting: an extractor maps a request to a key, a lookup maps
/// the key to a limiter. A `None` lookup result means "no limiter for this
/// key" and the request passes unlimited.
pub struct Keyed<R> {
    extract: Extract<R>,
    lookup: Lookup,
}

impl<R> Clone for Keyed<R> {
    fn clone(&self) -> Self {
        Self {
            extract: self.extract.clone(),
            lookup: self.lookup.clone(),
        }
    }
}

impl<R> Keyed<R> {
    pub fn new<E, L>(extract: E, lookup: L) -> Self
    where
        E: Fn(&R) -> String + Send + Sync + 'static,
        L: Fn(&str) -> Option<Arc<dyn Limiter>> + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
            lookup: Arc::new(lookup),
        }
    }

    /// Like `new`, but the factory runs once per distinct key and its result
    /// is cached, so every request for a key shares one limiter instance.
    pub fn cached<E, F>(extract: E, factory: F) -> Self
    where
        E: Fn(&R) -> String + Send + Sync + 'static,
        F: Fn(&str) -> Option<Arc<dyn Limiter>> + Send + Sync + 'static,
    {
        let cache: Mutex<HashMap<String, Option<Arc<dyn Limiter>>>> =
            Mutex::new(HashMap::new());
        Self::new(extract, move |key| {
            let mut cache = cache.lock().unwrap();
            match cache.get(key) {
                Some(cached) => cached.clone(),
                None => {
                    let made = factory(key);
                    cache.insert(key.to_string(), made.clone());
                    made
                }
            }
        })
    }

    pub fn limiter_for(&self, request: &R) -> Option<Arc<dyn Limiter>> {
        let key = (self.extract)(request);
        (self.lookup)(&key)
    }

    pub async fn allow(&self, cx: &Context, request: &R) -> bool {
        match self.limiter_for(request) {
            Some(limiter) => limiter.allow(cx).await,
            None => true,
        }
    }

    pub async fn wait(&self, cx: &Context, request: &R) -> Result<(), Error> {
        match self.limiter_for(request) {
            Some(limiter) => limiter.wait(cx).await,
            None => Ok(()),
        }
    }
}
