/// Booking directory: who may talk to whom, persisted in sled
use crate::error::{InboxError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub property_id: String,
    pub property_title: String,
    pub participants: Vec<Participant>,
}

impl Booking {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.display_name.as_str())
    }

    fn validate(&self) -> Result<()> {
        let ids = std::iter::once(self.booking_id.as_str())
            .chain(std::iter::once(self.property_id.as_str()))
            .chain(self.participants.iter().map(|p| p.user_id.as_str()));
        for id in ids {
            if id.is_empty() || id.contains(':') {
                return Err(InboxError::Validation(format!("invalid identifier: {:?}", id)));
            }
        }
        if self.participants.len() < 2 {
            return Err(InboxError::Validation(
                "a booking needs at least two participants".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct BookingStore {
    tree: sled::Tree,
}

impl BookingStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        let tree = db
            .open_tree("bookings")
            .map_err(|e| InboxError::Storage(format!("bookings tree: {}", e)))?;
        Ok(Self { tree })
    }

    pub fn upsert(&self, booking: &Booking) -> Result<()> {
        booking.validate()?;
        let val = serde_json::to_vec(booking).map_err(InboxError::Serialization)?;
        self.tree
            .insert(booking.booking_id.as_bytes(), val)
            .map_err(|e| InboxError::Storage(format!("upsert booking: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, booking_id: &str) -> Result<Option<Booking>> {
        match self
            .tree
            .get(booking_id.as_bytes())
            .map_err(|e| InboxError::Storage(format!("get booking: {}", e)))?
        {
            Some(val) => {
                let b = serde_json::from_slice::<Booking>(&val).map_err(InboxError::Serialization)?;
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    /// Bookings in which `user_id` is a participant
    pub fn for_user(&self, user_id: &str) -> Result<Vec<Booking>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, val) = entry.map_err(|e| InboxError::Storage(format!("scan bookings: {}", e)))?;
            if let Ok(b) = serde_json::from_slice::<Booking>(&val) {
                if b.is_party(user_id) {
                    out.push(b);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(id: &str, guest: &str, host: &str) -> Booking {
        Booking {
            booking_id: id.to_string(),
            property_id: "villa-9".to_string(),
            property_title: "Seaside Villa".to_string(),
            participants: vec![Participant::new(guest, "Guest"), Participant::new(host, "Host")],
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = BookingStore::new(&db).unwrap();

        store.upsert(&booking("bk-1", "guest-1", "host-1")).unwrap();
        store.upsert(&booking("bk-2", "guest-2", "host-1")).unwrap();

        assert_eq!(store.get("bk-1").unwrap().unwrap().property_title, "Seaside Villa");
        assert!(store.get("missing").unwrap().is_none());
        assert_eq!(store.for_user("host-1").unwrap().len(), 2);
        assert_eq!(store.for_user("guest-2").unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_bad_ids() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = BookingStore::new(&db).unwrap();

        let err = store.upsert(&booking("bk:1", "guest-1", "host-1")).unwrap_err();
        assert!(matches!(err, InboxError::Validation(_)));

        let mut lonely = booking("bk-3", "guest-1", "host-1");
        lonely.participants.truncate(1);
        assert!(store.upsert(&lonely).is_err());
    }
}
