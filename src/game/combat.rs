//! Combat
//!
//! Parses shot and explosion reports and turns them into damage. Clients
//! report their own hits; the server checks them against weapon limits and
//! the targets' current lives before any damage is applied.

use crate::core::packet::Packet;
use crate::core::vec3::{Vec3, DMF, DNF};
use crate::game::weapon::Weapon;

/// Explosion damage falls off over `radius * EXPLOSION_DIST_SCALE`.
pub const EXPLOSION_DIST_SCALE: f32 = 1.5;

/// Self damage from explosions is divided by this.
pub const SELF_DAMAGE_DIV: i32 = 2;

/// One reported hit.
#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    /// Target client.
    pub target: u32,
    /// Target's life sequence as seen by the shooter.
    pub life_sequence: i32,
    /// Distance from the shot origin or explosion centre.
    pub distance: f32,
    /// Rays that hit.
    pub rays: i32,
    /// Push direction.
    pub direction: Vec3,
}

/// Damage to apply to one target.
#[derive(Clone, Debug, PartialEq)]
pub struct Damage {
    /// Target client.
    pub target: u32,
    /// Damage points.
    pub amount: i32,
    /// Push direction.
    pub direction: Vec3,
}

fn read_vec(p: &mut Packet, scale: f32) -> Option<Vec3> {
    let mut v = [0; 3];
    for c in &mut v {
        *c = p.get_int()?;
    }
    Some(Vec3::from_wire(v, scale))
}

fn read_hits(p: &mut Packet) -> Option<Vec<Hit>> {
    let count = p.get_int()?;
    let mut hits = Vec::new();
    for _ in 0..count.max(0) {
        let target = p.get_int()?;
        let life_sequence = p.get_int()?;
        let distance = p.get_int()? as f32 / DMF;
        let rays = p.get_int()?;
        let direction = read_vec(p, DNF)?;
        if let Ok(target) = u32::try_from(target) {
            hits.push(Hit {
                target,
                life_sequence,
                distance,
                rays,
                direction,
            });
        }
    }
    Some(hits)
}

/// Damage of `rays` hitscan rays.
pub fn hitscan_damage(weapon: Weapon, rays: i32, multiplier: i32) -> i32 {
    rays * weapon.spec().damage * multiplier
}

/// Damage of an explosion at `distance`, halved for the shooter.
pub fn explosion_damage(weapon: Weapon, distance: f32, multiplier: i32, self_hit: bool) -> i32 {
    let spec = weapon.spec();
    let base = (spec.damage * multiplier) as f32;
    let falloff = 1.0 - distance / EXPLOSION_DIST_SCALE / spec.explosion_radius as f32;
    let damage = (base * falloff) as i32;
    if self_hit {
        damage / SELF_DAMAGE_DIV
    } else {
        damage
    }
}

// =============================================================================
// SHOTS
// =============================================================================

/// A fired weapon.
#[derive(Clone, Debug, PartialEq)]
pub struct Shot {
    /// Shooter's clock at the shot; also the projectile id.
    pub id: i32,
    /// Weapon fired.
    pub weapon: Weapon,
    /// Muzzle position.
    pub from: Vec3,
    /// Aim point.
    pub to: Vec3,
    /// Reported hits.
    pub hits: Vec<Hit>,
}

impl Shot {
    /// Parse a shot report: id, gun, origin, target, hits. An unknown gun
    /// reads as `Some(None)` so the caller can skip the message.
    pub fn read(p: &mut Packet) -> Option<Option<Shot>> {
        let id = p.get_int()?;
        let gun = p.get_int()?;
        let from = read_vec(p, DMF)?;
        let to = read_vec(p, DMF)?;
        let hits = read_hits(p)?;
        Some(Weapon::from_id(gun).map(|weapon| Shot {
            id,
            weapon,
            from,
            to,
            hits,
        }))
    }

    /// Validate the hits and compute their damage. `life_of` returns the
    /// life sequence of an alive target.
    pub fn damages(&self, multiplier: i32, life_of: impl Fn(u32) -> Option<i32>) -> Vec<Damage> {
        let spec = self.weapon.spec();
        let mut total_rays = 0;
        let mut out = Vec::new();
        for h in &self.hits {
            if life_of(h.target) != Some(h.life_sequence)
                || h.distance < 0.0
                || h.distance > (spec.range + 1) as f32
                || h.rays <= 0
                || h.rays > spec.rays
            {
                continue;
            }
            total_rays = i32::saturating_add(total_rays, h.rays);
            if total_rays > spec.rays {
                continue;
            }
            out.push(Damage {
                target: h.target,
                amount: hitscan_damage(self.weapon, h.rays, multiplier),
                direction: h.direction,
            });
        }
        out
    }
}

/// A projectile explosion.
#[derive(Clone, Debug, PartialEq)]
pub struct Explosion {
    /// Shooter's clock at the explosion.
    pub millis: i32,
    /// Weapon the projectile came from.
    pub weapon: Weapon,
    /// Projectile id (the shot's id).
    pub id: i32,
    /// Reported hits.
    pub hits: Vec<Hit>,
}

impl Explosion {
    /// Parse an explosion report: millis, gun, id, hits.
    pub fn read(p: &mut Packet) -> Option<Option<Explosion>> {
        let millis = p.get_int()?;
        let gun = p.get_int()?;
        let id = p.get_int()?;
        let hits = read_hits(p)?;
        Some(Weapon::from_id(gun).map(|weapon| Explosion {
            millis,
            weapon,
            id,
            hits,
        }))
    }

    /// Validate the hits and compute their damage. Each target is hit at
    /// most once.
    pub fn damages(&self, shooter: u32, multiplier: i32, life_of: impl Fn(u32) -> Option<i32>) -> Vec<Damage> {
        let radius = self.weapon.spec().explosion_radius as f32;
        let mut out: Vec<Damage> = Vec::new();
        for h in &self.hits {
            if out.iter().any(|d| d.target == h.target)
                || life_of(h.target) != Some(h.life_sequence)
                || h.distance < 0.0
                || h.distance > radius
            {
                continue;
            }
            let amount = explosion_damage(self.weapon, h.distance, multiplier, h.target == shooter);
            out.push(Damage {
                target: h.target,
                amount,
                direction: h.direction,
            });
        }
        out
    }
}
