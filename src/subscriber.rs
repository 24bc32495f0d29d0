//! Seam to the containing application's scene model.
//!
//! Scene objects subscribe to mesh results and feed the priority scorer.
//! The repository holds them weakly; a dropped object simply stops
//! contributing score and its callbacks are skipped.

use std::sync::Arc;

use crate::mesh::{MeshId, SkinInfo, Volume};

/// What the scorer needs to know about one tracked object right now.
/// `None` from [`SceneObject::view`] means the object is not drawable and
/// contributes nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectView {
    /// World radius of the drawable.
    pub radius: f32,
    pub camera_distance: f32,
    /// Present when the object is rigged or attached to an avatar.
    pub rig: Option<RigView>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigView {
    /// Diagonal of the owning avatar's animated extents box.
    pub avatar_extent_diagonal: f32,
    /// Animesh-style control avatars use half the diagonal.
    pub is_control_avatar: bool,
    pub is_self: bool,
    /// False while the avatar is still receiving its initial attachment
    /// data; such avatars are slightly de-prioritised.
    pub has_first_full_attachment_data: bool,
}

/// Subscriber capability set. All callbacks arrive on the main thread
/// during [`MeshRepository::tick`].
///
/// [`MeshRepository::tick`]: crate::repository::MeshRepository::tick
pub trait SceneObject {
    fn on_mesh_loaded(&self, mesh_id: MeshId, volume: &Volume, lod: usize);

    /// The requested LOD cannot be delivered; `substitute_lod` is the
    /// nearest level known to exist, if any.
    fn on_mesh_unavailable(&self, mesh_id: MeshId, lod: usize, substitute_lod: Option<usize>);

    fn on_skin_loaded(&self, skin: &Arc<SkinInfo>);
    fn on_skin_unavailable(&self, mesh_id: MeshId);
    fn on_physics_unavailable(&self, mesh_id: MeshId);

    /// Scoring input; `None` while the object has no drawable.
    fn view(&self) -> Option<ObjectView>;
}

/// Priority score for one tracked object. Rigged and attached objects are
/// scored against the owning avatar so a whole outfit loads together.
pub fn calculate_score(view: &ObjectView) -> f32 {
    let radius = match view.rig {
        Some(rig) => {
            let mut radius = if rig.is_control_avatar {
                rig.avatar_extent_diagonal * 0.5
            } else {
                rig.avatar_extent_diagonal
            };
            if !rig.is_self && !rig.has_first_full_attachment_data {
                // Slightly deprioritize avatars that are still receiving data.
                radius *= 0.9;
            }
            radius
        }
        None => view.radius,
    };
    radius / view.camera_distance.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object_scores_radius_over_distance() {
        let view = ObjectView {
            radius: 4.0,
            camera_distance: 8.0,
            rig: None,
        };
        assert_eq!(calculate_score(&view), 0.5);
    }

    #[test]
    fn distance_is_floored_at_one() {
        let view = ObjectView {
            radius: 2.0,
            camera_distance: 0.25,
            rig: None,
        };
        assert_eq!(calculate_score(&view), 2.0);
    }

    #[test]
    fn rigged_objects_use_avatar_extents() {
        let mut view = ObjectView {
            radius: 0.1,
            camera_distance: 10.0,
            rig: Some(RigView {
                avatar_extent_diagonal: 2.0,
                is_control_avatar: false,
                is_self: true,
                has_first_full_attachment_data: false,
            }),
        };
        assert_eq!(calculate_score(&view), 0.2);

        // Control avatars halve the diagonal.
        view.rig.as_mut().unwrap().is_control_avatar = true;
        assert_eq!(calculate_score(&view), 0.1);
    }

    #[test]
    fn loading_foreign_avatars_are_deprioritised() {
        let view = ObjectView {
            radius: 0.1,
            camera_distance: 1.0,
            rig: Some(RigView {
                avatar_extent_diagonal: 1.0,
                is_control_avatar: false,
                is_self: false,
                has_first_full_attachment_data: false,
            }),
        };
        assert!((calculate_score(&view) - 0.9).abs() < 1e-6);
    }
}
