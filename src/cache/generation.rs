//! Cache generations and the single-writer register naming the current one.
use std::sync::Mutex;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Installing,
    Active,
    Superseded,
}

impl GenerationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationPhase::Installing => "installing",
            GenerationPhase::Active => "active",
            GenerationPhase::Superseded => "superseded",
        }
    }

    pub fn parse_phase(s: &str) -> Option<Self> {
        match s {
            "installing" => Some(GenerationPhase::Installing),
            "active" => Some(GenerationPhase::Active),
            "superseded" => Some(GenerationPhase::Superseded),
            _ => None,
        }
    }

    /// Lifecycle only moves forward; `Superseded` is terminal.
    pub fn can_advance_to(&self, next: GenerationPhase) -> bool {
        matches!(
            (self, next),
            (GenerationPhase::Installing, GenerationPhase::Active)
                | (GenerationPhase::Active, GenerationPhase::Superseded)
        )
    }
}

/// A generation that finished installing and may be activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledGeneration {
    pub name: String,
    pub assets: usize,
}

/// Holds the name of the current generation.
///
/// Readers take the read lock for as long as they write into the generation they
/// observed; activation takes the write lock while it purges and swaps, so no
/// request can write into a generation that is being retired.
#[derive(Debug, Default)]
pub struct GenerationRegister {
    current: RwLock<Option<String>>,
    superseded: Mutex<Vec<String>>,
}

impl GenerationRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(&self, name: &str) {
        *self.current.write().await = Some(name.to_string());
    }

    pub async fn current(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.current.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Option<String>> {
        self.current.write().await
    }

    /// Swap in `next` under an already-held write guard; returns the retired name.
    pub fn swap(&self, guard: &mut RwLockWriteGuard<'_, Option<String>>, next: &str) -> Option<String> {
        let previous = guard.replace(next.to_string())?;
        if previous == next {
            return None;
        }
        self.superseded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(previous.clone());
        Some(previous)
    }

    pub fn is_superseded(&self, name: &str) -> bool {
        self.superseded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|n| n == name)
    }

    /// Names retired by activations in this process, oldest first.
    pub fn superseded(&self) -> Vec<String> {
        self.superseded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn teardown(&self) {
        *self.current.write().await = None;
        self.superseded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_advance() {
        use GenerationPhase::*;
        assert!(Installing.can_advance_to(Active));
        assert!(Active.can_advance_to(Superseded));
        assert!(!Superseded.can_advance_to(Active));
        assert!(!Superseded.can_advance_to(Installing));
        assert!(!Active.can_advance_to(Installing));
        assert!(!Installing.can_advance_to(Superseded));
        assert_eq!(GenerationPhase::parse_phase(Active.as_str()), Some(Active));
    }

    #[tokio::test]
    async fn swap_records_retired_generation() {
        let register = GenerationRegister::new();
        assert!(register.current().await.is_none());

        register.init("news-reader-v1").await;
        {
            let mut guard = register.write().await;
            assert_eq!(
                register.swap(&mut guard, "news-reader-v2").as_deref(),
                Some("news-reader-v1")
            );
            // Re-activating the same name retires nothing.
            assert!(register.swap(&mut guard, "news-reader-v2").is_none());
        }
        assert_eq!(register.current().await.as_deref(), Some("news-reader-v2"));
        assert_eq!(register.superseded(), vec!["news-reader-v1".to_string()]);
        assert!(register.is_superseded("news-reader-v1"));
        assert!(!register.is_superseded("news-reader-v2"));

        register.teardown().await;
        assert!(register.current().await.is_none());
        assert!(register.superseded().is_empty());
    }
}
