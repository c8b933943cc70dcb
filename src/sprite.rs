use std::{pin::Pin, ptr::NonNull};

use smallvec::SmallVec;

use crate::palette::{Color, PaletteMixer};

/// Entries in the physical hardware sprite table.
pub const HW_SPRITE_SLOTS: usize = 128;
/// Pixels past the view edge a sprite may sit before the draw pass skips
/// it.
pub const CULL_MARGIN: i32 = 32;

const SLOT_WORDS: usize = HW_SPRITE_SLOTS / 64;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Vec2 {
    pub x: i32,
    pub y: i32,
}

impl Vec2 {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Rect {
    pub pos: Vec2,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(pos: Vec2, width: i32, height: i32) -> Self {
        Self { pos, width, height }
    }

    fn inflate(self, margin: i32) -> Self {
        Self {
            pos: Vec2::new(self.pos.x - margin, self.pos.y - margin),
            width: self.width + margin * 2,
            height: self.height + margin * 2,
        }
    }

    fn contains(self, p: Vec2) -> bool {
        p.x >= self.pos.x
            && p.y >= self.pos.y
            && p.x < self.pos.x + self.width
            && p.y < self.pos.y + self.height
    }
}

/// Shadow copy of one hardware sprite register. A platform backend commits
/// the whole table at vsync; this core only keeps it consistent.
#[derive(Clone, Copy, Default, Debug)]
pub struct OamEntry {
    pub x: i16,
    pub y: i16,
    pub tile: u16,
    pub bank: u8,
    pub enabled: bool,
}

/// The 128-slot table plus slot bookkeeping. One bit per slot: `free` for
/// claim/release, `drawn` for which entries were written since the last
/// frame clear.
struct SpriteTable {
    free: [u64; SLOT_WORDS],
    drawn: [u64; SLOT_WORDS],
    oam: [OamEntry; HW_SPRITE_SLOTS],
}

impl SpriteTable {
    fn new() -> Self {
        Self {
            free: [!0; SLOT_WORDS],
            drawn: [0; SLOT_WORDS],
            oam: [OamEntry::default(); HW_SPRITE_SLOTS],
        }
    }

    /// Linear scan of the free bitset. Worst case O(slot count), which is
    /// small and fixed.
    fn claim(&mut self) -> Option<u8> {
        for (w, word) in self.free.iter_mut().enumerate() {
            let bit = word.trailing_zeros();
            if bit < 64 {
                *word &= !(1u64 << bit);
                return Some((w * 64 + bit as usize) as u8);
            }
        }
        None
    }

    fn release(&mut self, slot: u8) {
        let (w, bit) = (slot as usize / 64, 1u64 << (slot as usize % 64));
        debug_assert!(self.free[w] & bit == 0, "slot released twice");
        self.free[w] |= bit;
        // never leave a stale entry for the hardware to scan out
        self.oam[slot as usize].enabled = false;
    }

    fn free_slots(&self) -> u32 {
        self.free.iter().map(|w| w.count_ones()).sum()
    }
}

/// Claimed slot of a live [`Sprite`]. Releasing is purely drop-driven.
struct SlotBinding {
    table: NonNull<SpriteTable>,
    slot: u8,
}

impl Drop for SlotBinding {
    fn drop(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(slot = self.slot, "Releasing sprite slot");
        unsafe { self.table.as_mut().release(self.slot) };
    }
}

/// A logical sprite. Holds either no hardware slot or exactly one, claimed
/// by [`Sprite::bind`] and held for the rest of the sprite's life;
/// repositioning never changes the slot.
pub struct Sprite {
    pub pos: Vec2,
    pub tile: u16,
    pub layer: i8,
    /// Color-flash/translucency request, applied through the palette mixer
    /// at draw time
    pub mix: Option<(Color, u8)>,
    binding: Option<SlotBinding>,
}

impl Sprite {
    pub fn new(tile: u16) -> Self {
        Self {
            pos: Vec2::default(),
            tile,
            layer: 0,
            mix: None,
            binding: None,
        }
    }

    /// Claim a hardware slot. `false` when the table is full, in which
    /// case the sprite stays unbound and draws nothing. Binding an already
    /// bound sprite is a no-op success.
    ///
    /// The sprite must not outlive `screen`: the binding releases its slot
    /// into the screen's table on drop.
    pub fn bind(&mut self, screen: &mut Screen) -> bool {
        if self.binding.is_some() {
            return true;
        }
        match screen.claim() {
            Some((table, slot)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(slot, tile = self.tile, "Claimed sprite slot");
                self.binding = Some(SlotBinding { table, slot });
                true
            }
            None => false,
        }
    }

    pub fn bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn slot(&self) -> Option<u8> {
        self.binding.as_ref().map(|b| b.slot)
    }
}

/// Platform boundary of the render pass: `clear` at frame start, `draw`
/// per visible sprite, `display` at frame end.
pub struct Screen {
    table: Pin<Box<SpriteTable>>,
    view: Rect,
    mixer: PaletteMixer,
    frame: u64,
}

impl Screen {
    pub fn new(view: Rect, mixer: PaletteMixer) -> Self {
        Self {
            table: Box::pin(SpriteTable::new()),
            view,
            mixer,
            frame: 0,
        }
    }

    /// Camera moved; culling follows the new rectangle from the next draw.
    pub fn set_view(&mut self, view: Rect) {
        self.view = view;
    }

    pub fn view(&self) -> Rect {
        self.view
    }

    fn claim(&mut self) -> Option<(NonNull<SpriteTable>, u8)> {
        let table = self.table.as_mut().get_mut();
        let slot = table.claim()?;
        Some((NonNull::from(table), slot))
    }

    /// Frame start: forget which entries last frame wrote.
    pub fn clear(&mut self) {
        self.table.as_mut().get_mut().drawn = [0; SLOT_WORDS];
    }

    /// Write `sprite`'s hardware entry for this frame.
    ///
    /// Unbound sprites draw nothing. Sprites outside the view rectangle
    /// (inflated by [`CULL_MARGIN`]) are skipped entirely, binding or not;
    /// their slot entry simply stays off this frame. This is what keeps a
    /// large logical entity count inside the 128-entry ceiling.
    pub fn draw(&mut self, sprite: &Sprite) {
        let Some(binding) = &sprite.binding else {
            return;
        };
        if !self.view.inflate(CULL_MARGIN).contains(sprite.pos) {
            return;
        }
        let bank = match sprite.mix {
            Some((color, amount)) => self.mixer.color_mix(color, amount),
            None => 0,
        };
        let slot = binding.slot as usize;
        let table = self.table.as_mut().get_mut();
        table.oam[slot] = OamEntry {
            x: (sprite.pos.x - self.view.pos.x) as i16,
            y: (sprite.pos.y - self.view.pos.y) as i16,
            tile: sprite.tile,
            bank,
            enabled: true,
        };
        table.drawn[slot / 64] |= 1 << (slot % 64);
    }

    /// Frame end: disable every claimed entry that was not drawn this
    /// frame, hand the per-frame palette banks back, advance the frame
    /// counter. Slot-to-sprite bindings survive; only their visibility
    /// resets.
    pub fn display(&mut self) {
        let table = self.table.as_mut().get_mut();
        for w in 0..SLOT_WORDS {
            let mut stale = !table.free[w] & !table.drawn[w];
            while stale != 0 {
                let bit = stale.trailing_zeros() as usize;
                table.oam[w * 64 + bit].enabled = false;
                stale &= stale - 1;
            }
        }
        self.mixer.reset();
        self.frame += 1;
    }

    pub fn oam(&self) -> &[OamEntry; HW_SPRITE_SLOTS] {
        &self.table.oam
    }

    pub fn mixer(&self) -> &PaletteMixer {
        &self.mixer
    }

    pub fn free_slots(&self) -> u32 {
        self.table.free_slots()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

/// Transient, unordered collection of sprite refs built by the render
/// pass, depth-sorted before the entries are written.
pub struct SpriteBatch<'a> {
    items: SmallVec<[&'a Sprite; HW_SPRITE_SLOTS]>,
}

impl<'a> SpriteBatch<'a> {
    pub fn new() -> Self {
        Self {
            items: SmallVec::new(),
        }
    }

    pub fn push(&mut self, sprite: &'a Sprite) {
        self.items.push(sprite);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sort back-to-front by (layer, y) and write every entry.
    pub fn draw(&mut self, screen: &mut Screen) {
        self.items.sort_unstable_by_key(|s| (s.layer, s.pos.y));
        for sprite in &self.items {
            screen.draw(sprite);
        }
    }
}

impl Default for SpriteBatch<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::BANK_COLORS;

    fn screen() -> Screen {
        let mixer = PaletteMixer::new([Color::default(); BANK_COLORS], 1);
        Screen::new(Rect::new(Vec2::new(0, 0), 240, 160), mixer)
    }

    #[test]
    fn table_exhausts_at_hw_limit_test() {
        let mut screen = screen();

        let mut sprites: Vec<Sprite> = (0..HW_SPRITE_SLOTS as u16).map(Sprite::new).collect();
        for s in &mut sprites {
            assert!(s.bind(&mut screen));
        }
        assert_eq!(screen.free_slots(), 0);

        let mut extra = Sprite::new(999);
        assert!(!extra.bind(&mut screen));
        assert!(!extra.bound());

        // destroying one bound sprite frees exactly one slot
        sprites.pop();
        assert_eq!(screen.free_slots(), 1);
        assert!(extra.bind(&mut screen));
        assert_eq!(screen.free_slots(), 0);
    }

    #[test]
    fn binding_is_stable_test() {
        let mut screen = screen();
        let mut sprite = Sprite::new(7);

        assert!(sprite.bind(&mut screen));
        let slot = sprite.slot().unwrap();

        sprite.pos = Vec2::new(100, 50);
        screen.draw(&sprite);
        assert!(sprite.bind(&mut screen)); // no-op
        assert_eq!(sprite.slot(), Some(slot));
        assert!(screen.oam()[slot as usize].enabled);
        assert_eq!(screen.oam()[slot as usize].x, 100);
    }

    #[test]
    fn culled_sprite_writes_nothing_test() {
        let mut screen = screen();
        let mut sprite = Sprite::new(1);
        assert!(sprite.bind(&mut screen));

        sprite.pos = Vec2::new(240 + CULL_MARGIN, 0);
        screen.clear();
        screen.draw(&sprite);
        let slot = sprite.slot().unwrap() as usize;
        assert!(!screen.oam()[slot].enabled);

        // just inside the margin is visible
        sprite.pos = Vec2::new(240 + CULL_MARGIN - 1, 0);
        screen.draw(&sprite);
        assert!(screen.oam()[slot].enabled);
    }

    #[test]
    fn display_disables_undrawn_entries_test() {
        let mut screen = screen();
        let mut sprite = Sprite::new(1);
        assert!(sprite.bind(&mut screen));
        let slot = sprite.slot().unwrap() as usize;

        screen.clear();
        screen.draw(&sprite);
        screen.display();
        assert!(screen.oam()[slot].enabled);

        // next frame the sprite walks out of view; its entry must not
        // linger
        sprite.pos = Vec2::new(-CULL_MARGIN - 50, 0);
        screen.clear();
        screen.draw(&sprite);
        screen.display();
        assert!(!screen.oam()[slot].enabled);
        assert!(sprite.bound());
        assert_eq!(screen.frame(), 2);
    }

    #[test]
    fn drop_releases_and_disables_test() {
        let mut screen = screen();
        let slot;
        {
            let mut sprite = Sprite::new(3);
            assert!(sprite.bind(&mut screen));
            screen.draw(&sprite);
            slot = sprite.slot().unwrap() as usize;
            assert!(screen.oam()[slot].enabled);
        }
        assert_eq!(screen.free_slots(), HW_SPRITE_SLOTS as u32);
        assert!(!screen.oam()[slot].enabled);
    }

    #[test]
    fn batch_draws_depth_sorted_test() {
        let mut screen = screen();

        let mut near = Sprite::new(1);
        near.layer = 1;
        near.mix = Some((Color::rgb(31, 0, 0), 200));
        assert!(near.bind(&mut screen));

        let mut far = Sprite::new(2);
        far.layer = 0;
        far.mix = Some((Color::rgb(0, 31, 0), 200));
        assert!(far.bind(&mut screen));

        let mut batch = SpriteBatch::new();
        batch.push(&near);
        batch.push(&far);
        batch.draw(&mut screen);

        // far draws first, so it claims the lower palette bank
        let near_bank = screen.oam()[near.slot().unwrap() as usize].bank;
        let far_bank = screen.oam()[far.slot().unwrap() as usize].bank;
        assert!(far_bank < near_bank);

        screen.display();
        assert_eq!(screen.mixer().in_use(), 0);
    }
}
