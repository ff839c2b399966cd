//! Component contract
//!
//! The entity layer above this crate defines its own component types; the
//! storage and indexing core only needs a narrow view of them: a stable id,
//! a type discriminator, and the list of directly attached sub-components.
//!
//! Each component type declares its attachments explicitly in
//! [`Component::attached_components`] - exactly its single-valued and
//! list-valued sub-component fields. Sub-components held inside maps or other
//! nested containers are not part of the contract and must not be listed.

/// Narrow view of a domain component as seen by the storage core
pub trait Component {
    /// Unique identifier, assigned when the component is added to a system
    fn id(&self) -> Option<u64>;

    /// Type discriminator (the component type's name)
    fn component_type(&self) -> &'static str;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Directly attached sub-components: single-valued fields and the
    /// elements of list-valued fields, in declaration order.
    fn attached_components(&self) -> Vec<&dyn Component> {
        Vec::new()
    }

    /// Description of an instance, used in log lines and error messages
    fn label(&self) -> String {
        let name = self.name();
        if name.is_empty() {
            match self.id() {
                Some(id) => format!("{}.{}", self.component_type(), id),
                None => self.component_type().to_string(),
            }
        } else {
            format!("{}.{}", self.component_type(), name)
        }
    }
}
