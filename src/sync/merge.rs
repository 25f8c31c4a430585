use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::LessonRecord;

/// Fold fetched homework into lessons, matching strictly by lesson id.
/// Lessons without an id or without an entry are left as they are.
/// Applying the same map twice gives the same result; a lesson already
/// holding different text is reported as a conflict.
pub fn merge(lessons: Vec<LessonRecord>, homework: &HashMap<String, String>) -> Result<Vec<LessonRecord>> {
    lessons
        .into_iter()
        .map(|mut lesson| {
            let Some(text) = lesson.lesson_id.as_ref().and_then(|id| homework.get(id)) else {
                return Ok(lesson);
            };
            if lesson.homework.as_ref().is_some_and(|existing| existing != text) {
                return Err(Error::MergeConflict {
                    lesson_id: lesson.lesson_id.clone().unwrap_or_default(),
                    message: "lesson already carries different homework".into(),
                });
            }
            lesson.homework = Some(text.clone());
            Ok(lesson)
        })
        .collect()
}

/// Attach full teacher names, falling back to the initials.
pub fn apply_teacher_names(lessons: &mut [LessonRecord], teachers: &HashMap<String, String>) {
    for lesson in lessons {
        let name = teachers
            .get(&lesson.teacher_initials)
            .cloned()
            .unwrap_or_else(|| lesson.teacher_initials.clone());
        lesson.teacher_name = Some(name);
    }
}
