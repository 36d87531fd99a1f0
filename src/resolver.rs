use crate::domain::{BidsEntity, Label};
use crate::error::ResolutionError;
use crate::fields::FieldTable;
use crate::naming::StructuredIdentifier;
use crate::participants::ParticipantTable;

#[derive(Debug, Clone, Copy)]
pub struct EntityResolver<'a> {
    fields: &'a FieldTable,
    participants: &'a ParticipantTable,
}

impl<'a> EntityResolver<'a> {
    pub fn new(fields: &'a FieldTable, participants: &'a ParticipantTable) -> Self {
        Self {
            fields,
            participants,
        }
    }

    pub fn resolve(&self, id: &StructuredIdentifier) -> Result<BidsEntity, ResolutionError> {
        let spec = self
            .fields
            .get(id.field)
            .ok_or(ResolutionError::UnknownFieldCode(id.field))?;
        if !spec.accepts_extension(&id.extension) {
            return Err(ResolutionError::UnexpectedExtension {
                field: id.field,
                extension: id.extension.clone(),
            });
        }

        let subject = id.subject.parse::<Label>()?;
        let session = match id.instance {
            None => None,
            Some(instance) => match self.participants.session_for(&id.subject, instance)? {
                Some(label) => Some(label),
                None => Some(format!("{instance:02}").parse::<Label>()?),
            },
        };
        let run = (spec.multi_run || id.array > 0).then_some(id.array + 1);

        Ok(BidsEntity {
            subject,
            session,
            datatype: spec.datatype,
            suffix: spec.suffix.clone(),
            run,
            extension: id.extension.clone(),
        })
    }
}
