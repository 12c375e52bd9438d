//! Bone hierarchy with reference-pose transforms and name lookup.
//!
//! The transform pipeline:
//! 1. Bones are stored in topological order (parents before children)
//! 2. `component_space_ref_pose()` walks the hierarchy root-to-leaf
//! 3. Accumulates `cs[i] = cs[parent[i]] * local_ref_pose[i]`
//!
//! Weight-editing code pre-inverts the result once so that per-frame
//! deformation is a plain transform + weighted sum per influence.

use std::collections::HashMap;

use glam::Affine3A;
use marrow_core::{BoneIndex, MarrowError, Result};

/// A single bone: name, parent link and local-space reference pose.
#[derive(Debug, Clone)]
pub struct Bone {
    pub name: String,
    pub parent: Option<BoneIndex>,
    pub local_ref_pose: Affine3A,
}

impl Bone {
    pub fn new(name: impl Into<String>, parent: Option<BoneIndex>, local_ref_pose: Affine3A) -> Self {
        Self {
            name: name.into(),
            parent,
            local_ref_pose,
        }
    }
}

/// A read-only bone hierarchy.
///
/// Invariants checked at construction: bone names are unique, parent
/// indices refer to earlier bones (topological order), and bone 0 is the
/// root.
#[derive(Debug, Clone)]
pub struct Skeleton {
    bones: Vec<Bone>,
    name_to_index: HashMap<String, BoneIndex>,
}

impl Skeleton {
    pub fn new(bones: Vec<Bone>) -> Result<Self> {
        if bones.is_empty() {
            return Err(MarrowError::SkeletonError(
                "skeleton must contain at least one bone".to_string(),
            ));
        }
        if bones[0].parent.is_some() {
            return Err(MarrowError::SkeletonError(
                "bone 0 must be the root (no parent)".to_string(),
            ));
        }

        let mut name_to_index = HashMap::with_capacity(bones.len());
        for (index, bone) in bones.iter().enumerate() {
            if let Some(parent) = bone.parent {
                if parent >= index {
                    return Err(MarrowError::SkeletonError(format!(
                        "bone '{}' has parent {} at or after its own index {}",
                        bone.name, parent, index
                    )));
                }
            }
            if name_to_index.insert(bone.name.clone(), index).is_some() {
                return Err(MarrowError::SkeletonError(format!(
                    "duplicate bone name '{}'",
                    bone.name
                )));
            }
        }

        Ok(Self {
            bones,
            name_to_index,
        })
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    pub fn bone_name(&self, bone: BoneIndex) -> &str {
        &self.bones[bone].name
    }

    pub fn bone_index(&self, name: &str) -> Option<BoneIndex> {
        self.name_to_index.get(name).copied()
    }

    pub fn parent_index(&self, bone: BoneIndex) -> Option<BoneIndex> {
        self.bones[bone].parent
    }

    pub fn local_ref_pose(&self, bone: BoneIndex) -> Affine3A {
        self.bones[bone].local_ref_pose
    }

    /// Direct children of a bone, in index order.
    pub fn direct_children(&self, bone: BoneIndex) -> Vec<BoneIndex> {
        self.bones
            .iter()
            .enumerate()
            .filter(|(_, b)| b.parent == Some(bone))
            .map(|(index, _)| index)
            .collect()
    }

    /// Compute component-space reference-pose transforms by walking the
    /// hierarchy root-to-leaf. Topological ordering of the bone array
    /// guarantees a single forward pass suffices.
    pub fn component_space_ref_pose(&self) -> Vec<Affine3A> {
        let mut transforms = Vec::with_capacity(self.bones.len());
        for (index, bone) in self.bones.iter().enumerate() {
            debug_assert!(bone.parent.map_or(true, |p| p < index));
            let cs = match bone.parent {
                Some(parent) => transforms[parent] * bone.local_ref_pose,
                None => bone.local_ref_pose,
            };
            transforms.push(cs);
        }
        transforms
    }

    /// Find the bone on the other side of the mirror plane by swapping
    /// left/right naming tokens. Returns the bone itself when no mirrored
    /// counterpart exists (center bones mirror onto themselves).
    pub fn mirrored_bone_index(&self, bone: BoneIndex) -> BoneIndex {
        let name = &self.bones[bone].name;
        for candidate in mirrored_name_candidates(name) {
            if let Some(&mirrored) = self.name_to_index.get(&candidate) {
                return mirrored;
            }
        }
        bone
    }
}

/// Candidate mirrored names for a bone, in priority order.
///
/// Handles the common sided naming schemes: `Left`/`Right` and
/// `left`/`right` substrings, and `_l`/`_r` style suffixes in either
/// case.
fn mirrored_name_candidates(name: &str) -> Vec<String> {
    const SUBSTRING_PAIRS: [(&str, &str); 2] = [("Left", "Right"), ("left", "right")];
    const SUFFIX_PAIRS: [(&str, &str); 2] = [("_l", "_r"), ("_L", "_R")];

    let mut candidates = Vec::new();
    for (a, b) in SUBSTRING_PAIRS {
        if name.contains(a) {
            candidates.push(name.replace(a, b));
        } else if name.contains(b) {
            candidates.push(name.replace(b, a));
        }
    }
    for (a, b) in SUFFIX_PAIRS {
        if let Some(stem) = name.strip_suffix(a) {
            candidates.push(format!("{stem}{b}"));
        } else if let Some(stem) = name.strip_suffix(b) {
            candidates.push(format!("{stem}{a}"));
        }
    }
    candidates
}
