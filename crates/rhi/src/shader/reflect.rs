//! Binding and vertex-input reflection over naga modules.

use naga::{AddressSpace, Binding, ImageClass, Module, ScalarKind, TypeInner, VectorSize};

use super::ShaderError;
use crate::descriptor::{DescriptorKind, MAX_BINDINGS, MAX_SETS, NamedDescriptor, StageMask};
use crate::pipeline::VertexFormat;

/// A resource binding declared by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Byte size of a block, zero otherwise.
    pub size: u32,
    /// Names that address the whole binding: the variable and, for blocks,
    /// the block type.
    pub names: Vec<String>,
    /// Block members as `(name, offset, size)`.
    pub members: Vec<(String, u32, u32)>,
    pub stages: StageMask,
}

impl ReflectedBinding {
    /// One descriptor per name plus one per block member.
    pub fn descriptors(&self) -> impl Iterator<Item = NamedDescriptor> + '_ {
        let whole = self.names.iter().map(|name| NamedDescriptor {
            name: name.clone(),
            set: self.set,
            binding: self.binding,
            offset: 0,
            size: self.size,
            kind: self.kind,
        });
        let members = self
            .members
            .iter()
            .map(|(name, offset, size)| NamedDescriptor {
                name: name.clone(),
                set: self.set,
                binding: self.binding,
                offset: *offset,
                size: *size,
                kind: self.kind,
            });
        whole.chain(members)
    }
}

/// Collects every global with an explicit set/binding.
pub(crate) fn reflect_bindings(
    module: &Module,
    stage: StageMask,
) -> Result<Vec<ReflectedBinding>, ShaderError> {
    let ctx = module.to_ctx();
    let mut bindings = Vec::new();

    for (_, var) in module.global_variables.iter() {
        let Some(resource) = var.binding.as_ref() else {
            continue;
        };
        let ty = &module.types[var.ty];

        let kind = match (var.space, &ty.inner) {
            (AddressSpace::Uniform, _) => DescriptorKind::UniformBuffer,
            (AddressSpace::Storage { .. }, _) => DescriptorKind::StorageBuffer,
            (
                AddressSpace::Handle,
                TypeInner::Image {
                    class: ImageClass::Storage { .. },
                    ..
                },
            ) => DescriptorKind::StorageImage,
            (AddressSpace::Handle, TypeInner::Image { .. }) => DescriptorKind::SampledTexture,
            (AddressSpace::Handle, TypeInner::Sampler { .. }) => DescriptorKind::Sampler,
            _ => continue,
        };

        let mut names = Vec::new();
        if let Some(name) = var.name.as_ref().filter(|n| !n.is_empty()) {
            names.push(name.clone());
        }

        if resource.group as usize >= MAX_SETS || resource.binding as usize >= MAX_BINDINGS {
            return Err(ShaderError::BindingOutOfRange {
                name: names.first().cloned().unwrap_or_default(),
                set: resource.group,
                binding: resource.binding,
            });
        }

        let mut size = 0;
        let mut members = Vec::new();
        if matches!(
            kind,
            DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer
        ) {
            size = ty.inner.size(ctx);
            if let Some(block) = ty.name.as_ref().filter(|n| !names.contains(n)) {
                names.push(block.clone());
            }
            if let TypeInner::Struct {
                members: ref fields,
                ..
            } = ty.inner
            {
                for field in fields {
                    if let Some(name) = &field.name {
                        let field_size = module.types[field.ty].inner.size(ctx);
                        members.push((name.clone(), field.offset, field_size));
                    }
                }
            }
        }

        bindings.push(ReflectedBinding {
            set: resource.group,
            binding: resource.binding,
            kind,
            size,
            names,
            members,
            stages: stage,
        });
    }

    Ok(bindings)
}

/// Location and format of every vertex-stage input.
pub(crate) fn reflect_vertex_inputs(module: &Module) -> Vec<(u32, VertexFormat)> {
    let Some(entry) = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga::ShaderStage::Vertex)
    else {
        return Vec::new();
    };

    let mut inputs: Vec<(u32, VertexFormat)> = entry
        .function
        .arguments
        .iter()
        .filter_map(|arg| {
            let Some(Binding::Location { location, .. }) = &arg.binding else {
                return None;
            };
            vertex_format(&module.types[arg.ty].inner).map(|format| (*location, format))
        })
        .collect();
    inputs.sort_by_key(|(location, _)| *location);
    inputs
}

fn vertex_format(inner: &TypeInner) -> Option<VertexFormat> {
    let (scalar, count) = match *inner {
        TypeInner::Scalar(scalar) => (scalar, 1),
        TypeInner::Vector { size, scalar } => (
            scalar,
            match size {
                VectorSize::Bi => 2,
                VectorSize::Tri => 3,
                VectorSize::Quad => 4,
            },
        ),
        _ => return None,
    };
    if scalar.width != 4 {
        return None;
    }

    use VertexFormat::*;
    let format = match (scalar.kind, count) {
        (ScalarKind::Float, 1) => Float,
        (ScalarKind::Float, 2) => Float2,
        (ScalarKind::Float, 3) => Float3,
        (ScalarKind::Float, 4) => Float4,
        (ScalarKind::Sint, 1) => Int,
        (ScalarKind::Sint, 2) => Int2,
        (ScalarKind::Sint, 3) => Int3,
        (ScalarKind::Sint, 4) => Int4,
        (ScalarKind::Uint, 1) => UInt,
        (ScalarKind::Uint, 2) => UInt2,
        (ScalarKind::Uint, 3) => UInt3,
        (ScalarKind::Uint, 4) => UInt4,
        _ => return None,
    };
    Some(format)
}
