//! Tables built by reflection over `facet::Facet` output types.
//!
//! Columns come from the struct's fields, in declaration order:
//!
//! - the header is the field name in upper case with `_` as a space
//!   (`image_name` becomes `IMAGE NAME`);
//! - fields starting with `full_` are left out (they carry untruncated IDs
//!   for JSON consumers), as are fields marked `#[facet(skip)]`;
//! - `None` renders as `<none>`, matching how the engine shows untagged
//!   images.

use comfy_table::{Cell, Table};
use facet::{Facet, Field, Peek, ScalarType, Type, UserType};

use super::output::create_styled_table;

/// Placeholder for absent optional values.
const NONE: &str = "<none>";

#[derive(Debug, Clone)]
struct Column {
    /// Title-case field name, e.g. `Image Name`.
    title: String,
    field_index: usize,
}

impl Column {
    fn header(&self) -> String {
        self.title.to_uppercase()
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn columns(fields: &[Field]) -> Vec<Column> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, field)| {
            !field.should_skip_deserializing()
                && !field.name.starts_with("full_")
                && !field.name.starts_with('_')
        })
        .map(|(field_index, field)| Column {
            title: title_case(field.name),
            field_index,
        })
        .collect()
}

fn struct_fields(shape: &'static facet::Shape) -> Option<&'static [Field]> {
    match &shape.ty {
        Type::User(UserType::Struct(struct_type)) => Some(struct_type.fields),
        _ => None,
    }
}

/// Render one field value as cell text.
fn cell_text(peek: Peek<'_, '_>) -> String {
    if let Ok(option) = peek.into_option() {
        return match option.value() {
            Some(inner) => cell_text(inner),
            None => NONE.to_string(),
        };
    }

    let shape = peek.shape();
    match shape.scalar_type() {
        Some(ScalarType::Bool) => match peek.get::<bool>() {
            Ok(true) => "yes".to_string(),
            Ok(false) => "no".to_string(),
            Err(_) => "?".to_string(),
        },
        Some(_) => peek.to_string(),
        None if shape.is_display() => peek.to_string(),
        None if shape.is_debug() => format!("{peek:?}"),
        None => "?".to_string(),
    }
}

/// Cell text for every column of one item.
fn row<'a, T: Facet<'a>>(item: &T, columns: &[Column]) -> Vec<String> {
    let Ok(fields) = Peek::new(item).into_struct() else {
        return Vec::new();
    };
    columns
        .iter()
        .map(|column| match fields.field(column.field_index) {
            Ok(value) => cell_text(value),
            Err(_) => "?".to_string(),
        })
        .collect()
}

/// One row per item, one column per displayed field.
pub fn table_from_slice<'a, T: Facet<'a>>(items: &[T]) -> Table {
    let mut table = create_styled_table();
    let Some(fields) = struct_fields(T::SHAPE) else {
        return table;
    };
    let columns = columns(fields);
    table.set_header(columns.iter().map(Column::header).collect::<Vec<_>>());
    for item in items {
        table.add_row(row(item, &columns));
    }
    table
}

/// A two-column `Field`/`Value` table describing one item.
pub fn table_from_item<'a, T: Facet<'a>>(item: &T) -> Table {
    let mut table = create_styled_table();
    table.set_header(vec!["Field", "Value"]);
    let Some(fields) = struct_fields(T::SHAPE) else {
        return table;
    };
    let columns = columns(fields);
    for (column, value) in columns.iter().zip(row(item, &columns)) {
        table.add_row(vec![Cell::new(&column.title), Cell::new(value)]);
    }
    table
}
