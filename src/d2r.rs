//! Depth-first walk over a document tree.
//!
//! The walker knows nothing about tables or metadata: it threads a
//! [`VisitContext`] through the recursion and reports documents, arrays and
//! array-valued array elements to a [`D2RCallback`], which decides where rows go.

use crate::document::{Document, Value};
use crate::error::Result;
use crate::reference::{AttributeReference, Key, TableRef};
use crate::translate::to_table_ref;

/// Where the walker currently is.
#[derive(Debug, Clone)]
pub struct VisitContext<R> {
    pub attribute_reference: AttributeReference,
    /// The document part rows created at this point belong to.
    pub table_ref: TableRef,
    /// The row of the enclosing document or array element, none at the root.
    pub parent_row: Option<R>,
}

pub trait D2RCallback {
    type Row: Copy;
    /// A document at `context.attribute_reference`. When the reference ends
    /// with an array key the document is an array element. Returns the row
    /// its entries were written to.
    fn visit_document(&mut self, document: &Document, context: &VisitContext<Self::Row>) -> Result<Self::Row>;
    /// A non-empty array at `context.attribute_reference`; `context.table_ref`
    /// is the part holding its elements. Scalar elements are handled here.
    fn visit_array(&mut self, array: &[Value], context: &VisitContext<Self::Row>) -> Result<()>;
    /// An element of an array that is itself an array. Returns the row its
    /// own elements hang from.
    fn visit_array_element(&mut self, index: usize, context: &VisitContext<Self::Row>) -> Result<Self::Row>;
}

pub struct D2RVisitor;

impl D2RVisitor {
    pub fn visit<C: D2RCallback>(document: &Document, callback: &mut C) -> Result<()> {
        let context = VisitContext {
            attribute_reference: AttributeReference::root(),
            table_ref: TableRef::root(),
            parent_row: None,
        };
        walk_document(document, &context, callback)
    }
}

fn walk_document<C: D2RCallback>(document: &Document, context: &VisitContext<C::Row>, callback: &mut C) -> Result<()> {
    let row = callback.visit_document(document, context)?;
    for (key, value) in document.iter() {
        match value {
            Value::Document(nested) => {
                let child = VisitContext {
                    attribute_reference: context.attribute_reference.append(Key::object(key)),
                    table_ref: context.table_ref.child(key),
                    parent_row: Some(row),
                };
                walk_document(nested, &child, callback)?;
            }
            Value::Array(items) => {
                let reference = context.attribute_reference.append(Key::object(key));
                walk_array(items, reference, Some(row), callback)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn walk_array<C: D2RCallback>(
    items: &[Value],
    reference: AttributeReference,
    parent_row: Option<C::Row>,
    callback: &mut C,
) -> Result<()> {
    // an empty array leaves no trace besides its marker in the parent row
    if items.is_empty() {
        return Ok(());
    }
    let context = VisitContext {
        table_ref: to_table_ref(&reference.append(Key::Array(0))),
        attribute_reference: reference,
        parent_row,
    };
    callback.visit_array(items, &context)?;
    for (index, item) in items.iter().enumerate() {
        let element = VisitContext {
            attribute_reference: context.attribute_reference.append(Key::Array(index)),
            table_ref: context.table_ref.clone(),
            parent_row,
        };
        match item {
            Value::Document(nested) => walk_document(nested, &element, callback)?,
            Value::Array(inner) => {
                let row = callback.visit_array_element(index, &element)?;
                walk_array(inner, element.attribute_reference, Some(row), callback)?;
            }
            _ => {}
        }
    }
    Ok(())
}
