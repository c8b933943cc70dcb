pub use crate::list::{CursorMut, List};
pub use crate::palette::{Color, PaletteMixer};
pub use crate::pool::{FixedPool, PoolBox, PoolError, TypedPool};
pub use crate::rc::{Rc, RcPool, Weak};
pub use crate::sprite::{Rect, Screen, Sprite, SpriteBatch, Vec2, HW_SPRITE_SLOTS};
pub use crate::{Entity, EntityGroup, GroupConfig, GroupError, Tick};
