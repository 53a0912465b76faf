use crate::caid::CaDescriptor;
use crate::emm::{EmmProvider, EmmReassembler};

/// A card announced by a card server.
#[derive(Debug, Clone)]
pub struct Card {
    pub id: u32,
    pub caid: u16,
    pub emm: EmmReassembler,
    /// Cleared on reconnect until the server announces the card again.
    pub running: bool,
    /// Multiplex whose EMM stream feeds this card.
    pub mux: Option<u32>,
}

impl Card {
    /// Whether `provider_id` is served by this card; 0 matches any.
    pub fn has_provider(&self, provider_id: u32) -> bool {
        provider_id == 0 || self.emm.providers().iter().any(|p| p.id == provider_id)
    }

    pub fn serves(&self, desc: &CaDescriptor) -> bool {
        self.running && self.caid == desc.caid && self.has_provider(desc.provider_id)
    }

    pub fn label(&self) -> String {
        let count = self.emm.providers().len();
        format!(
            "ID:{:08x} CAID:{:04x} with {} provider{}",
            self.id,
            self.caid,
            count,
            if count == 1 { "" } else { "s" }
        )
    }
}

/// One provider entry of a card announcement: 3-byte id and optional
/// shared address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: u32,
    pub sa: Option<[u8; 8]>,
}

impl ProviderInfo {
    pub fn from_id_bytes(id: [u8; 3], sa: Option<[u8; 8]>) -> Self {
        Self {
            id: u32::from(id[0]) << 16 | u32::from(id[1]) << 8 | u32::from(id[2]),
            sa,
        }
    }
}

#[derive(Debug, Default)]
pub struct CardTable {
    cards: Vec<Card>,
}

impl CardTable {
    /// Adds a card or refreshes the one with the same CAID and id. A zero
    /// unique address counts as none.
    pub fn upsert(&mut self, caid: u16, id: u32, ua: Option<[u8; 8]>, providers: &[ProviderInfo]) -> &mut Card {
        let ua = ua.unwrap_or_default();
        let providers: Vec<EmmProvider> = providers
            .iter()
            .map(|p| EmmProvider::new(p.id, p.sa.unwrap_or_default()))
            .collect();

        let pos = match self.cards.iter().position(|c| c.caid == caid && c.id == id) {
            Some(pos) => {
                self.cards[pos].emm.set_card(ua, providers);
                pos
            }
            None => {
                self.cards.insert(
                    0,
                    Card {
                        id,
                        caid,
                        emm: EmmReassembler::new(caid, ua, providers),
                        running: false,
                        mux: None,
                    },
                );
                0
            }
        };
        let card = &mut self.cards[pos];
        card.running = true;
        card
    }

    pub fn remove(&mut self, id: u32) -> Option<Card> {
        let pos = self.cards.iter().position(|c| c.id == id)?;
        Some(self.cards.remove(pos))
    }

    pub fn invalidate(&mut self) {
        for card in &mut self.cards {
            card.running = false;
        }
    }

    pub fn clear(&mut self) {
        self.cards.clear();
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Card> {
        self.cards.iter_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Card> {
        self.cards.get_mut(index)
    }

    pub fn get(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    /// Index of the first running card that serves `desc`.
    pub fn position_serving(&self, desc: &CaDescriptor) -> Option<usize> {
        self.cards.iter().position(|c| c.serves(desc))
    }

    /// Whether any card belongs to a CA system whose EMMs can be matched.
    pub fn emm_capable(&self) -> bool {
        self.cards.iter().any(|c| c.emm.is_known_vendor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(caid: u16, provider_id: u32) -> CaDescriptor {
        CaDescriptor {
            caid,
            provider_id,
            pid: 0x100,
        }
    }

    #[test]
    fn test_upsert_refreshes_existing_card() {
        let mut table = CardTable::default();
        let providers = [ProviderInfo::from_id_bytes([0x00, 0x00, 0x21], None)];
        table.upsert(0x0500, 7, Some([0, 0, 0, 0, 1, 2, 3, 4]), &providers);
        table.invalidate();
        assert!(!table.iter().next().unwrap().running);

        let card = table.upsert(0x0500, 7, None, &[]);
        assert!(card.running);
        assert_eq!(card.emm.unique_address(), &[0; 8]);
        assert!(card.emm.providers().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_provider_matching() {
        let mut table = CardTable::default();
        let providers = [ProviderInfo::from_id_bytes([0x04, 0x08, 0x20], None)];
        table.upsert(0x0500, 1, None, &providers);

        assert_eq!(table.position_serving(&desc(0x0500, 0)), Some(0));
        assert_eq!(table.position_serving(&desc(0x0500, 0x040820)), Some(0));
        assert_eq!(table.position_serving(&desc(0x0500, 0x040830)), None);
        assert_eq!(table.position_serving(&desc(0x0b00, 0)), None);

        table.invalidate();
        assert_eq!(table.position_serving(&desc(0x0500, 0)), None);
    }

    #[test]
    fn test_remove_and_label() {
        let mut table = CardTable::default();
        table.upsert(0x0b00, 0x11, None, &[ProviderInfo { id: 0, sa: None }]);
        table.upsert(0x0100, 0x22, None, &[]);
        assert!(table.emm_capable());
        assert_eq!(table.iter().next().unwrap().label(), "ID:00000022 CAID:0100 with 0 providers");
        assert!(table.remove(0x22).is_some());
        assert!(table.remove(0x22).is_none());
        assert_eq!(table.iter().next().unwrap().label(), "ID:00000011 CAID:0b00 with 1 provider");
    }
}
